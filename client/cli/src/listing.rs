//! Paginated directory listing
//!
//! A `ListingController` owns exactly one `ListingSession`, bound to a
//! `(bucket, prefix)` pair. Pages are fetched sequentially with a continuation
//! cursor and merged into an accumulated entry sequence in arrival order.
//!
//! Every request is issued under a `PageTicket` that records the session it
//! belongs to. Navigation replaces the session, so a response that arrives
//! for an older ticket is dropped at merge time instead of leaking into the
//! new directory.

use crate::error::ListingError;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_DELIMITER: char = '/';
pub const DEFAULT_PAGE_SIZE: u32 = 100;

// ============================================================================
// TYPES
// ============================================================================

/// Opaque continuation token returned by the listing API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub key: String,
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    /// Name as shown to the user; folders carry a trailing delimiter
    pub fn display_name(&self) -> String {
        if self.is_folder {
            format!("{}{}", self.name, DEFAULT_DELIMITER)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: char,
    pub page_size: u32,
    pub cursor: Option<PageCursor>,
}

#[derive(Debug, Clone)]
pub struct FolderDescriptor {
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing as returned by a backend
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub folders: Vec<FolderDescriptor>,
    pub files: Vec<FileDescriptor>,
    pub has_more: bool,
    pub next_cursor: Option<PageCursor>,
}

/// Source of listing pages. Selected once, when the controller is built.
pub trait ListingBackend {
    fn list_page(
        &self,
        request: ListRequest,
    ) -> impl Future<Output = Result<ListPage, ListingError>> + Send;
}

impl<T: ListingBackend + Send + Sync> ListingBackend for Arc<T> {
    fn list_page(
        &self,
        request: ListRequest,
    ) -> impl Future<Output = Result<ListPage, ListingError>> + Send {
        (**self).list_page(request)
    }
}

/// Identity of an outstanding page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTicket {
    pub session: SessionId,
    pub cursor: Option<PageCursor>,
}

#[derive(Debug, Clone)]
pub struct ListingSession {
    id: SessionId,
    bucket: String,
    prefix: String,
    entries: Arc<Vec<DirectoryEntry>>,
    cursor: Option<PageCursor>,
    has_more: bool,
    in_flight: Option<PageTicket>,
}

impl ListingSession {
    fn new(id: SessionId, bucket: &str, prefix: &str) -> Self {
        Self {
            id,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            entries: Arc::default(),
            cursor: None,
            has_more: true,
            in_flight: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn cursor(&self) -> Option<&PageCursor> {
        self.cursor.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Read-only view published to subscribers after every state change
#[derive(Debug, Clone, Default)]
pub struct ListingSnapshot {
    pub session: Option<SessionId>,
    pub bucket: String,
    pub prefix: String,
    pub entries: Arc<Vec<DirectoryEntry>>,
    pub has_more: bool,
    pub loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A page for the live session is still outstanding
    InFlight,
    /// The session has no further pages
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was merged; carries the number of entries it added
    Merged { added: usize },
    Skipped(SkipReason),
    /// The response belonged to a session that is no longer live
    Stale,
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct ListingController<B> {
    backend: B,
    delimiter: char,
    page_size: u32,
    session: Option<ListingSession>,
    next_session: u64,
    notifier: watch::Sender<ListingSnapshot>,
}

impl<B: ListingBackend> ListingController<B> {
    pub fn new(backend: B, page_size: u32) -> Self {
        let (notifier, _) = watch::channel(ListingSnapshot::default());
        Self {
            backend,
            delimiter: DEFAULT_DELIMITER,
            page_size: page_size.max(1),
            session: None,
            next_session: 0,
            notifier,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn session(&self) -> Option<&ListingSession> {
        self.session.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListingSnapshot> {
        self.notifier.subscribe()
    }

    /// Fetch one page and merge it.
    ///
    /// `reset=true` always starts a fresh session. `reset=false` continues the
    /// live session when it is bound to the same `(bucket, prefix)`.
    pub async fn load(
        &mut self,
        bucket: &str,
        prefix: &str,
        reset: bool,
    ) -> Result<LoadOutcome, ListingError> {
        let (ticket, request) = match self.begin(bucket, prefix, reset)? {
            Ok(pending) => pending,
            Err(reason) => return Ok(LoadOutcome::Skipped(reason)),
        };
        let result = self.backend.list_page(request).await;
        self.complete(&ticket, result)
    }

    /// Start over at `prefix` in the live session's bucket
    pub async fn navigate(&mut self, prefix: &str) -> Result<LoadOutcome, ListingError> {
        let bucket = self
            .session
            .as_ref()
            .map(|s| s.bucket.clone())
            .ok_or(ListingError::EmptyBucket)?;
        self.load(&bucket, prefix, true).await
    }

    /// Continue the live session; a no-op when there is nothing more to fetch
    pub async fn load_more(&mut self) -> Result<LoadOutcome, ListingError> {
        let Some(session) = &self.session else {
            return Ok(LoadOutcome::Skipped(SkipReason::Exhausted));
        };
        let (bucket, prefix) = (session.bucket.clone(), session.prefix.clone());
        self.load(&bucket, &prefix, false).await
    }

    /// Register an outstanding page request.
    ///
    /// Returns the ticket and the request to send, or the reason nothing
    /// should be sent. The outer `Result` reports invalid arguments.
    #[allow(clippy::type_complexity)]
    pub fn begin(
        &mut self,
        bucket: &str,
        prefix: &str,
        reset: bool,
    ) -> Result<Result<(PageTicket, ListRequest), SkipReason>, ListingError> {
        validate_target(bucket, prefix, self.delimiter)?;

        let same_target = self
            .session
            .as_ref()
            .is_some_and(|s| s.bucket == bucket && s.prefix == prefix);

        if reset || !same_target {
            self.next_session += 1;
            let id = SessionId(self.next_session);
            debug!(session = id.0, bucket, prefix, "starting listing session");
            self.session = Some(ListingSession::new(id, bucket, prefix));
        }

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(Err(SkipReason::Exhausted)),
        };
        if session.in_flight.is_some() {
            return Ok(Err(SkipReason::InFlight));
        }
        if !session.has_more {
            return Ok(Err(SkipReason::Exhausted));
        }

        let ticket = PageTicket {
            session: session.id,
            cursor: session.cursor.clone(),
        };
        session.in_flight = Some(ticket.clone());
        let request = ListRequest {
            bucket: session.bucket.clone(),
            prefix: session.prefix.clone(),
            delimiter: self.delimiter,
            page_size: self.page_size,
            cursor: session.cursor.clone(),
        };
        self.publish();
        Ok(Ok((ticket, request)))
    }

    /// Apply the result of a request issued under `ticket`.
    ///
    /// A ticket that no longer matches the live session's outstanding
    /// request is stale: nothing is changed and `LoadOutcome::Stale` is
    /// returned, even for errors.
    pub fn complete(
        &mut self,
        ticket: &PageTicket,
        result: Result<ListPage, ListingError>,
    ) -> Result<LoadOutcome, ListingError> {
        let delimiter = self.delimiter;
        let notifier = &self.notifier;
        let session = match self.session.as_mut() {
            Some(s) if s.id == ticket.session && s.in_flight.as_ref() == Some(ticket) => s,
            _ => {
                debug!(session = ticket.session.0, "dropping stale listing response");
                return Ok(LoadOutcome::Stale);
            }
        };
        session.in_flight = None;

        let outcome = match result {
            Ok(page) => {
                let has_more = page.has_more;
                let next_cursor = page.next_cursor.clone();
                // Drop the published reference first so the merge can extend
                // the entries in place instead of copying them
                notifier.send_if_modified(|snapshot| {
                    snapshot.entries = Arc::default();
                    false
                });
                let entries = Arc::make_mut(&mut session.entries);
                let added = merge_page(entries, &session.prefix, delimiter, page);
                if has_more && next_cursor.is_none() {
                    warn!(prefix = %session.prefix, "backend reported more pages without a cursor");
                }
                session.has_more = has_more && next_cursor.is_some();
                session.cursor = next_cursor;
                info!(
                    added,
                    total = session.entries.len(),
                    has_more = session.has_more,
                    "merged listing page"
                );
                Ok(LoadOutcome::Merged { added })
            }
            Err(e) => {
                warn!(prefix = %session.prefix, "listing page failed: {}", e);
                Err(e)
            }
        };
        self.publish();
        outcome
    }

    fn publish(&self) {
        let snapshot = match &self.session {
            Some(s) => ListingSnapshot {
                session: Some(s.id),
                bucket: s.bucket.clone(),
                prefix: s.prefix.clone(),
                entries: Arc::clone(&s.entries),
                has_more: s.has_more,
                loading: s.in_flight.is_some(),
            },
            None => ListingSnapshot::default(),
        };
        // No receivers just means nobody is watching
        self.notifier.send_replace(snapshot);
    }
}

fn validate_target(bucket: &str, prefix: &str, delimiter: char) -> Result<(), ListingError> {
    if bucket.is_empty() {
        return Err(ListingError::EmptyBucket);
    }
    if !prefix.is_empty() && !prefix.ends_with(delimiter) {
        return Err(ListingError::InvalidPrefix {
            prefix: prefix.to_string(),
            delimiter,
        });
    }
    Ok(())
}

// ============================================================================
// MERGE
// ============================================================================

/// Strip `prefix` and one leading delimiter from `key`
pub fn relative_name<'a>(key: &'a str, prefix: &str, delimiter: char) -> &'a str {
    let name = if !prefix.is_empty() {
        key.strip_prefix(prefix).unwrap_or(key)
    } else {
        key
    };
    name.strip_prefix(delimiter).unwrap_or(name)
}

/// Turn user input like `/docs`, `docs` or `docs/` into the prefix `docs/`.
/// Empty input and `/` mean the bucket root.
pub fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim().trim_matches(DEFAULT_DELIMITER);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}{}", trimmed, DEFAULT_DELIMITER)
    }
}

/// Append one page to `entries`. Returns how many entries were added.
///
/// Folders come first, then files, each in the order the backend sent them.
/// Folder keys already present are skipped. Anything whose name relative to
/// `prefix` is empty or still contains the delimiter belongs to another level
/// and is dropped.
pub fn merge_page(
    entries: &mut Vec<DirectoryEntry>,
    prefix: &str,
    delimiter: char,
    page: ListPage,
) -> usize {
    let before = entries.len();
    let mut folder_keys: HashSet<String> = entries
        .iter()
        .filter(|e| e.is_folder)
        .map(|e| e.key.clone())
        .collect();

    for folder in page.folders {
        let rel = relative_name(&folder.key, prefix, delimiter);
        let name = rel.strip_suffix(delimiter).unwrap_or(rel);
        if name.is_empty() || name.contains(delimiter) {
            warn!(key = %folder.key, "skipping folder outside the current level");
            continue;
        }
        if !folder_keys.insert(folder.key.clone()) {
            continue;
        }
        entries.push(DirectoryEntry {
            name: name.to_string(),
            key: folder.key,
            is_folder: true,
            size: 0,
            last_modified: None,
        });
    }

    for file in page.files {
        let name = relative_name(&file.key, prefix, delimiter);
        if name.is_empty() {
            warn!(key = %file.key, "skipping file with empty name");
            continue;
        }
        if name.contains(delimiter) {
            warn!(key = %file.key, "skipping file from a nested folder");
            continue;
        }
        entries.push(DirectoryEntry {
            name: name.to_string(),
            key: file.key.clone(),
            is_folder: false,
            size: file.size,
            last_modified: file.last_modified,
        });
    }

    entries.len() - before
}

// ============================================================================
// SORTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn toggled(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

/// Display ordering: folders first, then `key` in `direction`, ties in
/// arrival order.
pub fn sorted_view(
    entries: &[DirectoryEntry],
    key: SortKey,
    direction: SortDirection,
) -> Vec<DirectoryEntry> {
    let mut view = entries.to_vec();
    view.sort_by(|a, b| {
        match (a.is_folder, b.is_folder) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let ord = match key {
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortKey::Size => a.size.cmp(&b.size),
            SortKey::Modified => timestamp(a).cmp(&timestamp(b)),
        };
        match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    });
    view
}

fn timestamp(entry: &DirectoryEntry) -> i64 {
    entry
        .last_modified
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

// ============================================================================
// INFINITE SCROLL
// ============================================================================

/// Rows from the bottom at which the next page is requested
pub const LOAD_MORE_THRESHOLD_ROWS: usize = 5;

/// What moved the viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMotion {
    /// Toward the start of the listing
    Up,
    /// Toward the end, or the listing grew under a resting viewport
    Down,
}

/// Decides when a scroll position should request the next page
#[derive(Debug, Clone)]
pub struct ScrollTracker {
    threshold: usize,
}

impl Default for ScrollTracker {
    fn default() -> Self {
        Self::new(LOAD_MORE_THRESHOLD_ROWS)
    }
}

impl ScrollTracker {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn should_load(
        &self,
        motion: ScrollMotion,
        offset: usize,
        content_len: usize,
        viewport_len: usize,
        has_more: bool,
        in_flight: bool,
    ) -> bool {
        if motion == ScrollMotion::Up {
            return false;
        }
        let distance_to_bottom = content_len.saturating_sub(offset + viewport_len);
        distance_to_bottom < self.threshold && has_more && !in_flight
    }
}
