//! TUI for a key check run with progress display

use crate::checker::{KeyResult, ProgressEvent, RunStats, StopHandle};
use crate::Result;
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::time::Duration;

/// Maximum number of recent keys to keep for display
const MAX_RECENT_KEYS: usize = 100;

/// Run monitor TUI application state
pub struct RunMonitorApp {
    /// Progress events from the runner; closes when the run ends
    events: UnboundedReceiver<ProgressEvent>,
    /// Used when the user asks to stop
    stop: StopHandle,
    title: String,
    total: usize,
    checked: usize,
    valid_count: usize,
    invalid_count: usize,
    error_count: usize,
    /// Recent valid keys
    recent_valid: VecDeque<KeyResult>,
    /// Recent invalid and error keys
    recent_rejected: VecDeque<KeyResult>,
    /// Selected list (0 = valid, 1 = rejected)
    selected_list: usize,
    list_state: ListState,
    status_message: String,
    is_complete: bool,
    is_stopping: bool,
    should_quit: bool,
}

impl RunMonitorApp {
    pub fn new(
        title: impl Into<String>,
        total: usize,
        events: UnboundedReceiver<ProgressEvent>,
        stop: StopHandle,
    ) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            events,
            stop,
            title: title.into(),
            total,
            checked: 0,
            valid_count: 0,
            invalid_count: 0,
            error_count: 0,
            recent_valid: VecDeque::new(),
            recent_rejected: VecDeque::new(),
            selected_list: 0,
            list_state,
            status_message: "Checking keys... Press 'q' to stop.".to_string(),
            is_complete: false,
            is_stopping: false,
            should_quit: false,
        }
    }

    /// Start from counters of an earlier, resumed run
    pub fn with_counts(mut self, stats: &RunStats) -> Self {
        self.checked = stats.checked;
        self.valid_count = stats.valid;
        self.invalid_count = stats.invalid;
        self.error_count = stats.error;
        self
    }

    /// Run the TUI application until the run ends and the user quits
    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            self.drain_events();
            // Let the runner make progress between frames
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.is_complete {
                        self.is_complete = true;
                        self.status_message = format!(
                            "{}! Checked: {}/{} | Valid: {} | Invalid: {} | Error: {} | Press 'q' to quit",
                            if self.is_stopping { "Stopped" } else { "Complete" },
                            self.checked,
                            self.total,
                            self.valid_count,
                            self.invalid_count,
                            self.error_count
                        );
                    }
                    break;
                }
            }
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        self.checked = event.checked;
        self.total = event.total;
        self.valid_count = event.valid;
        self.invalid_count = event.invalid;
        self.error_count = event.error;

        let recent = if event.result.is_valid() {
            &mut self.recent_valid
        } else {
            &mut self.recent_rejected
        };
        recent.push_back(event.result);
        if recent.len() > MAX_RECENT_KEYS {
            recent.pop_front();
        }

        if !self.is_stopping {
            let percentage = (self.checked as f64 / self.total.max(1) as f64 * 100.0) as u32;
            self.status_message = format!(
                "Checking... {}% ({}/{}) | Valid: {} | Invalid: {} | Error: {}",
                percentage,
                self.checked,
                self.total,
                self.valid_count,
                self.invalid_count,
                self.error_count
            );
        }
    }

    fn handle_input(&mut self, key: KeyEvent) {
        // Raw mode delivers Ctrl-C as a key press rather than SIGINT
        let interrupt =
            key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);

        match key.code {
            _ if interrupt => self.quit_or_stop(),
            KeyCode::Char('q') | KeyCode::Esc => self.quit_or_stop(),
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(i) if i < len.saturating_sub(1) => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn quit_or_stop(&mut self) {
        if self.is_complete {
            self.should_quit = true;
        } else if !self.is_stopping {
            // In-flight probes finish; the view closes once the run ends
            self.stop.request_stop();
            self.is_stopping = true;
            self.status_message = "Stopping... waiting for in-flight probes to finish".to_string();
        }
    }

    fn selected_len(&self) -> usize {
        if self.selected_list == 0 {
            self.recent_valid.len()
        } else {
            self.recent_rejected.len()
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Key lists
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new(self.title.clone())
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let progress = if self.total > 0 {
            (self.checked as f64 / self.total as f64 * 100.0).min(100.0) as u16
        } else {
            0
        };
        let progress_label = format!("{}/{} ({}%)", self.checked, self.total, progress);
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress)
            .label(progress_label);
        f.render_widget(gauge, chunks[1]);

        let list_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        Self::render_key_list(
            f,
            list_chunks[0],
            "✓ Valid",
            &self.recent_valid,
            self.valid_count,
            self.selected_list == 0,
            if self.selected_list == 0 { Some(&mut self.list_state) } else { None },
        );

        Self::render_key_list(
            f,
            list_chunks[1],
            "✗ Invalid / ! Error",
            &self.recent_rejected,
            self.invalid_count + self.error_count,
            self.selected_list == 1,
            if self.selected_list == 1 { Some(&mut self.list_state) } else { None },
        );

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn render_key_list(
        f: &mut Frame,
        area: Rect,
        title: &str,
        results: &VecDeque<KeyResult>,
        total_count: usize,
        is_selected: bool,
        list_state: Option<&mut ListState>,
    ) {
        let items: Vec<ListItem> = results
            .iter()
            .rev() // Show newest first
            .map(|result| {
                let color = if result.is_valid() {
                    Color::Green
                } else if result.is_invalid() {
                    Color::Red
                } else {
                    Color::Yellow
                };
                let content = match result.response_time_ms {
                    Some(time) => format!("{} {} ({}ms)", mask_key(&result.key), result.message, time),
                    None => format!("{} {}", mask_key(&result.key), result.message),
                };
                ListItem::new(content).style(Style::default().fg(color))
            })
            .collect();

        let block_title = format!("{} ({})", title, total_count);
        let border_style = if is_selected {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(block_title)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");

        if let Some(state) = list_state {
            f.render_stateful_widget(list, area, state);
        } else {
            f.render_widget(list, area);
        }
    }
}

/// Shorten a key for display, keeping its head and tail
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return key.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn event(checked: usize, result: KeyResult) -> ProgressEvent {
        ProgressEvent {
            checked,
            total: 3,
            valid: usize::from(result.is_valid()),
            invalid: usize::from(result.is_invalid()),
            error: usize::from(result.is_error()),
            result,
        }
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-short"), "sk-short");
        assert_eq!(mask_key("sk-abcdefghijklmnopqrstuvwxyz"), "sk-abcde...wxyz");
    }

    #[test]
    fn test_events_update_counts_and_lists() {
        let (tx, rx) = unbounded_channel();
        let mut app = RunMonitorApp::new("test", 3, rx, StopHandle::default());

        tx.send(event(1, KeyResult::valid("sk-a".to_string(), "valid"))).unwrap();
        tx.send(event(2, KeyResult::error("sk-b".to_string(), "server error 500"))).unwrap();
        app.drain_events();

        assert_eq!(app.checked, 2);
        assert_eq!(app.recent_valid.len(), 1);
        assert_eq!(app.recent_rejected.len(), 1);
        assert!(!app.is_complete);

        drop(tx);
        app.drain_events();
        assert!(app.is_complete);
        assert!(app.status_message.starts_with("Complete!"));
    }

    #[test]
    fn test_quit_requests_stop_before_completion() {
        let (tx, rx) = unbounded_channel();
        let stop = StopHandle::default();
        let mut app = RunMonitorApp::new("test", 3, rx, stop.clone());

        app.handle_input(press(KeyCode::Char('q')));
        assert!(stop.is_stopped());
        assert!(!app.should_quit);

        drop(tx);
        app.drain_events();
        assert!(app.status_message.starts_with("Stopped!"));
        app.handle_input(press(KeyCode::Char('q')));
        assert!(app.should_quit);
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_ctrl_c_stops_like_quit() {
        let (tx, rx) = unbounded_channel();
        let stop = StopHandle::default();
        let mut app = RunMonitorApp::new("test", 3, rx, stop.clone());

        app.handle_input(press(KeyCode::Char('c')));
        assert!(!stop.is_stopped());

        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        app.handle_input(ctrl_c);
        assert!(stop.is_stopped());
        assert!(!app.should_quit);

        drop(tx);
        app.drain_events();
        app.handle_input(ctrl_c);
        assert!(app.should_quit);
    }
}
