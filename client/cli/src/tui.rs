use crate::api::ApiClient;
use crate::error::ListingError;
use crate::listing::{
    sorted_view, DirectoryEntry, ListPage, ListingBackend, ListingController, ListingSnapshot,
    LoadOutcome, PageTicket, ScrollMotion, ScrollTracker, SortDirection, SortKey,
    DEFAULT_DELIMITER,
};
use crate::format_size;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

type PageResult = (PageTicket, Result<ListPage, ListingError>);

struct App<B> {
    controller: ListingController<Arc<B>>,
    snapshot: watch::Receiver<ListingSnapshot>,
    results_tx: mpsc::UnboundedSender<PageResult>,
    results_rx: mpsc::UnboundedReceiver<PageResult>,
    view: Vec<DirectoryEntry>,
    sort_key: SortKey,
    sort_dir: SortDirection,
    selected: usize,
    offset: usize,
    viewport_rows: usize,
    tracker: ScrollTracker,
    status: Option<String>,
    quit: bool,
}

impl<B: ListingBackend + Send + Sync + 'static> App<B> {
    fn new(backend: Arc<B>, page_size: u32) -> Self {
        let controller = ListingController::new(backend, page_size);
        let snapshot = controller.subscribe();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            controller,
            snapshot,
            results_tx,
            results_rx,
            view: Vec::new(),
            sort_key: SortKey::Name,
            sort_dir: SortDirection::Ascending,
            selected: 0,
            offset: 0,
            viewport_rows: 20,
            tracker: ScrollTracker::default(),
            status: None,
            quit: false,
        }
    }

    fn bucket(&self) -> String {
        self.snapshot.borrow().bucket.clone()
    }

    fn prefix(&self) -> String {
        self.snapshot.borrow().prefix.clone()
    }

    /// Ask for a page without blocking the UI. The result comes back on the
    /// results channel and is merged only if its session is still live.
    fn request_page(&mut self, bucket: &str, prefix: &str, reset: bool) {
        match self.controller.begin(bucket, prefix, reset) {
            Ok(Ok((ticket, request))) => {
                let backend = Arc::clone(self.controller.backend());
                let tx = self.results_tx.clone();
                tokio::spawn(async move {
                    let result = backend.list_page(request).await;
                    let _ = tx.send((ticket, result));
                });
            }
            Ok(Err(reason)) => {
                tracing::debug!(?reason, "page request skipped");
            }
            Err(e) => self.status = Some(format!("! {}", e.notice())),
        }
    }

    fn navigate(&mut self, prefix: &str) {
        let bucket = self.bucket();
        self.selected = 0;
        self.offset = 0;
        self.status = None;
        self.request_page(&bucket, prefix, true);
    }

    /// Merge a finished page. Only a merged page may chain into the next
    /// request; failures wait for the user to scroll or refresh.
    fn handle_page(&mut self, ticket: PageTicket, result: Result<ListPage, ListingError>) {
        match self.controller.complete(&ticket, result) {
            Ok(LoadOutcome::Merged { .. }) => {
                self.refresh_view();
                // A short page may not fill the screen
                self.maybe_load_more(ScrollMotion::Down);
            }
            Ok(LoadOutcome::Stale) => tracing::debug!("ignored page for a previous folder"),
            Ok(LoadOutcome::Skipped(_)) => {}
            Err(e) => self.status = Some(format!("! {}", e.notice())),
        }
    }

    /// Apply every page that has arrived since the last frame
    fn tick(&mut self) {
        while let Ok((ticket, result)) = self.results_rx.try_recv() {
            self.handle_page(ticket, result);
        }
        if self.snapshot.has_changed().unwrap_or(false) {
            self.refresh_view();
        }
    }

    fn refresh_view(&mut self) {
        let snapshot = self.snapshot.borrow_and_update().clone();
        self.view = sorted_view(&snapshot.entries, self.sort_key, self.sort_dir);
        if self.selected >= self.view.len() {
            self.selected = self.view.len().saturating_sub(1);
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.view.is_empty() {
            return;
        }
        let max = self.view.len() as isize - 1;
        let motion = if delta < 0 {
            ScrollMotion::Up
        } else {
            ScrollMotion::Down
        };
        self.selected = (self.selected as isize + delta).clamp(0, max) as usize;
        let rows = self.viewport_rows.max(1);
        if self.selected < self.offset {
            self.offset = self.selected;
        } else if self.selected >= self.offset + rows {
            self.offset = self.selected + 1 - rows;
        }
        self.maybe_load_more(motion);
    }

    fn maybe_load_more(&mut self, motion: ScrollMotion) {
        let (has_more, loading) = {
            let snapshot = self.snapshot.borrow();
            (snapshot.has_more, snapshot.loading)
        };
        if self.tracker.should_load(
            motion,
            self.offset,
            self.view.len(),
            self.viewport_rows,
            has_more,
            loading,
        ) {
            let (bucket, prefix) = (self.bucket(), self.prefix());
            self.request_page(&bucket, &prefix, false);
        }
    }

    fn cycle_sort(&mut self) {
        self.sort_key = match self.sort_key {
            SortKey::Name => SortKey::Size,
            SortKey::Size => SortKey::Modified,
            SortKey::Modified => SortKey::Name,
        };
        self.refresh_view();
    }

    fn handle_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.quit = true,
            KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),
            KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
            KeyCode::PageDown => self.move_selection(self.viewport_rows as isize),
            KeyCode::PageUp => self.move_selection(-(self.viewport_rows as isize)),
            KeyCode::Enter | KeyCode::Right => {
                if let Some(entry) = self.view.get(self.selected) {
                    if entry.is_folder {
                        let key = entry.key.clone();
                        self.navigate(&key);
                    }
                }
            }
            KeyCode::Backspace | KeyCode::Left => {
                let prefix = self.prefix();
                if !prefix.is_empty() {
                    self.navigate(&parent_prefix(&prefix));
                }
            }
            KeyCode::Char('r') => {
                let prefix = self.prefix();
                self.navigate(&prefix);
            }
            KeyCode::Char('s') => self.cycle_sort(),
            KeyCode::Char('d') => {
                self.sort_dir = self.sort_dir.toggled();
                self.refresh_view();
            }
            _ => {}
        }
    }
}

/// `a/b/` -> `a/`, `a/` -> ``
pub fn parent_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches(DEFAULT_DELIMITER);
    match trimmed.rfind(DEFAULT_DELIMITER) {
        Some(pos) => trimmed[..=pos].to_string(),
        None => String::new(),
    }
}

pub async fn run_browser(
    client: Arc<ApiClient>,
    bucket: &str,
    prefix: &str,
    page_size: u32,
) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(client, page_size);
    app.request_page(bucket, prefix, true);

    let result = run_app(&mut terminal, &mut app).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_app<B: ListingBackend + Send + Sync + 'static>(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App<B>,
) -> anyhow::Result<()> {
    loop {
        app.tick();

        terminal.draw(|f| ui(f, app))?;

        if app.quit {
            return Ok(());
        }

        if event::poll(std::time::Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key.code);
                }
            }
        } else {
            tokio::task::yield_now().await;
        }
    }
}

fn ui<B: ListingBackend + Send + Sync + 'static>(f: &mut Frame, app: &mut App<B>) {
    let area = f.area();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(1),
            Constraint::Length(2),
        ])
        .split(area);

    let snapshot = app.snapshot.borrow().clone();
    let title = format!("{}/{}", snapshot.bucket, snapshot.prefix);
    let count = if snapshot.has_more {
        format!("{}+", snapshot.entries.len())
    } else {
        snapshot.entries.len().to_string()
    };
    let header = vec![
        Line::from(vec![
            Span::styled("shelf ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(title),
        ]),
        Line::from(format!(
            "{} items  sort: {:?} {:?}",
            count, app.sort_key, app.sort_dir
        )),
    ];
    f.render_widget(Paragraph::new(header), layout[0]);

    app.viewport_rows = layout[1].height as usize;
    let lines: Vec<Line> = app
        .view
        .iter()
        .enumerate()
        .skip(app.offset)
        .take(app.viewport_rows)
        .map(|(i, entry)| {
            let marker = if i == app.selected { ">" } else { " " };
            let size = if entry.is_folder {
                String::new()
            } else {
                format_size(entry.size)
            };
            let modified = entry
                .last_modified
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let text = format!(
                "{} {:<48} {:>10}  {}",
                marker,
                entry.display_name(),
                size,
                modified
            );
            if i == app.selected {
                Line::from(Span::styled(text, Style::default().add_modifier(Modifier::REVERSED)))
            } else {
                Line::from(text)
            }
        })
        .collect();
    f.render_widget(Paragraph::new(lines), layout[1]);

    let mut footer = Vec::new();
    if snapshot.loading {
        footer.push(Line::from("loading..."));
    } else if let Some(status) = &app.status {
        footer.push(Line::from(status.as_str()));
    } else {
        footer.push(Line::from(""));
    }
    footer.push(Line::from(
        "[enter] open  [backspace] up  [s] sort  [d] direction  [r] refresh  [q] quit",
    ));
    f.render_widget(Paragraph::new(footer), layout[2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::listing::{FileDescriptor, ListRequest, PageCursor};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves queued pages and counts how many were asked for
    #[derive(Default)]
    struct QueuedBackend {
        pages: Mutex<VecDeque<Result<ListPage, String>>>,
        calls: AtomicUsize,
    }

    impl QueuedBackend {
        fn new(pages: Vec<Result<ListPage, String>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ListingBackend for QueuedBackend {
        fn list_page(
            &self,
            _request: ListRequest,
        ) -> impl Future<Output = Result<ListPage, ListingError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.pages.lock().unwrap().pop_front();
            async move {
                match next {
                    Some(Ok(page)) => Ok(page),
                    Some(Err(message)) => Err(ApiError::api(message).into()),
                    None => Ok(ListPage::default()),
                }
            }
        }
    }

    fn files(prefix: &str, count: usize, next: Option<&str>) -> ListPage {
        ListPage {
            folders: vec![],
            files: (0..count)
                .map(|i| FileDescriptor {
                    key: format!("{}file-{:03}.txt", prefix, i),
                    size: 1,
                    last_modified: None,
                })
                .collect(),
            has_more: next.is_some(),
            next_cursor: next.map(|c| PageCursor(c.to_string())),
        }
    }

    /// Wait for the next page result and feed it through the app
    async fn receive(app: &mut App<QueuedBackend>) {
        let (ticket, result) = tokio::time::timeout(Duration::from_secs(5), app.results_rx.recv())
            .await
            .unwrap()
            .unwrap();
        app.handle_page(ticket, result);
    }

    /// Let spawned requests run, then apply what arrived
    async fn settle(app: &mut App<QueuedBackend>) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
            app.tick();
        }
    }

    fn loading(app: &App<QueuedBackend>) -> bool {
        app.snapshot.borrow().loading
    }

    #[test]
    fn test_parent_prefix() {
        assert_eq!(parent_prefix("docs/img/"), "docs/");
        assert_eq!(parent_prefix("docs/"), "");
        assert_eq!(parent_prefix(""), "");
    }

    #[tokio::test]
    async fn test_failed_page_is_not_retried_automatically() {
        let backend = QueuedBackend::new(vec![Err("bucket unavailable".to_string())]);
        let mut app = App::new(Arc::clone(&backend), 50);
        app.request_page("media", "", true);

        receive(&mut app).await;
        settle(&mut app).await;

        assert_eq!(backend.calls(), 1);
        assert!(!loading(&app));
        assert!(app.status.as_deref().unwrap().contains("bucket unavailable"));
        assert!(app.view.is_empty());
    }

    #[tokio::test]
    async fn test_short_page_continues_until_screen_is_full() {
        let backend = QueuedBackend::new(vec![
            Ok(files("", 3, Some("page-2"))),
            Ok(files("more-", 3, None)),
        ]);
        let mut app = App::new(Arc::clone(&backend), 3);
        app.request_page("media", "", true);

        receive(&mut app).await;
        assert!(loading(&app));
        receive(&mut app).await;
        settle(&mut app).await;

        assert_eq!(backend.calls(), 2);
        assert!(!loading(&app));
        assert_eq!(app.view.len(), 6);
        assert!(app.status.is_none());
    }

    #[tokio::test]
    async fn test_scrolling_up_near_the_bottom_does_not_load() {
        let backend = QueuedBackend::new(vec![
            Ok(files("", 30, Some("page-2"))),
            Ok(files("more-", 5, None)),
        ]);
        let mut app = App::new(Arc::clone(&backend), 30);
        app.request_page("media", "", true);
        receive(&mut app).await;
        assert!(!loading(&app));

        // Bottom row selected; stepping up keeps the offset where it was
        app.selected = 29;
        app.offset = 10;
        app.handle_key(KeyCode::Up);
        assert_eq!(app.offset, 10);
        assert!(!loading(&app));
        settle(&mut app).await;
        assert_eq!(backend.calls(), 1);

        app.handle_key(KeyCode::Down);
        assert!(loading(&app));
        receive(&mut app).await;
        assert_eq!(backend.calls(), 2);
        assert_eq!(app.view.len(), 35);
    }

    #[tokio::test]
    async fn test_page_for_previous_folder_is_ignored() {
        let backend = QueuedBackend::new(vec![Ok(files("img/", 2, None))]);
        let mut app = App::new(Arc::clone(&backend), 50);
        let (old_ticket, _) = app.controller.begin("media", "docs/", true).unwrap().unwrap();

        app.navigate("img/");
        app.handle_page(old_ticket, Ok(files("docs/", 4, Some("page-2"))));
        assert!(app.status.is_none());
        assert!(app.view.is_empty());

        receive(&mut app).await;
        settle(&mut app).await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(app.view.len(), 2);
        assert!(app.view.iter().all(|e| e.key.starts_with("img/")));
    }

    #[tokio::test]
    async fn test_navigate_resets_position_and_status() {
        let backend = QueuedBackend::new(vec![Ok(files("", 40, None)), Ok(files("docs/", 1, None))]);
        let mut app = App::new(Arc::clone(&backend), 50);
        app.request_page("media", "", true);
        receive(&mut app).await;

        app.selected = 30;
        app.offset = 15;
        app.status = Some("! stale".to_string());
        app.navigate("docs/");
        assert_eq!((app.selected, app.offset), (0, 0));
        assert!(app.status.is_none());

        receive(&mut app).await;
        assert_eq!(app.view.len(), 1);
        assert_eq!(app.prefix(), "docs/");
    }
}
