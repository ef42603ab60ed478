//! Terminal display surface
//!
//! Renders the chat screen with ratatui and reads keys from crossterm's
//! async event stream. Display updates queued through a `DisplayHandle` and
//! terminal events are merged on one loop; committed input lines go to the
//! [`InputRouter`].

use std::io::{self, Stdout};

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures_util::StreamExt;
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};
use ratatui::{Frame, Terminal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::command::InputRouter;
use crate::display::{ChatLine, DisplayUpdate, LineKind};
use crate::error::AppError;
use crate::types::PeerId;

const TITLE: &str = "Welcome to PeerNet.";
const USAGE: &str = "/room <name> switch room · /user <name> rename · /clear · /exit";
const PEER_BOX_WIDTH: u16 = 20;

/// Everything the screen shows
#[derive(Debug, Clone, Default)]
pub struct Screen {
    pub room: String,
    pub user: String,
    pub lines: Vec<ChatLine>,
    pub peers: Vec<PeerId>,
    /// Line being typed
    pub input: String,
}

impl Screen {
    pub fn new(room: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    /// Apply a queued update. Returns false on [`DisplayUpdate::Stop`].
    pub fn apply(&mut self, update: DisplayUpdate) -> bool {
        match update {
            DisplayUpdate::Append(line) => self.lines.push(line),
            DisplayUpdate::Clear => self.lines.clear(),
            DisplayUpdate::SetRoom(room) => self.room = room,
            DisplayUpdate::SetPeers(peers) => self.peers = peers,
            DisplayUpdate::SetUserLabel(user) => self.user = user,
            DisplayUpdate::Stop => return false,
        }
        true
    }

    /// Feed a key press to the input field
    ///
    /// Returns a committed line on Enter. Ctrl-C commits `/exit`.
    pub fn handle_key(&mut self, key: KeyEvent) -> Option<String> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some("/exit".to_string())
            }
            KeyCode::Char(c) => {
                self.input.push(c);
                None
            }
            KeyCode::Backspace => {
                self.input.pop();
                None
            }
            KeyCode::Enter => Some(std::mem::take(&mut self.input)),
            _ => None,
        }
    }

    fn input_label(&self) -> String {
        format!("{} > ", self.user)
    }
}

/// Run the terminal surface until a `Stop` update arrives
///
/// The terminal is restored before returning, also when drawing failed.
pub async fn run(
    mut screen: Screen,
    mut updates: mpsc::UnboundedReceiver<DisplayUpdate>,
    router: InputRouter,
) -> Result<(), AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = drive(&mut terminal, &mut screen, &mut updates, &router).await;

    restore(&mut terminal)?;
    result
}

fn restore(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), AppError> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

async fn drive<B: Backend>(
    terminal: &mut Terminal<B>,
    screen: &mut Screen,
    updates: &mut mpsc::UnboundedReceiver<DisplayUpdate>,
    router: &InputRouter,
) -> Result<(), AppError> {
    let mut events = EventStream::new();

    loop {
        terminal.draw(|frame| render(frame, screen))?;

        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                if !screen.apply(update) {
                    break;
                }
                // Drain whatever else is queued before redrawing
                while let Ok(update) = updates.try_recv() {
                    if !screen.apply(update) {
                        return Ok(());
                    }
                }
            }
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) => {
                    if let Some(line) = screen.handle_key(key) {
                        if let Err(e) = router.submit(&line).await {
                            debug!("input not delivered: {}", e);
                            break;
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("terminal event error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    Ok(())
}

fn render(frame: &mut Frame, screen: &Screen) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
            Constraint::Length(3),
        ])
        .split(frame.area());
    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(10), Constraint::Length(PEER_BOX_WIDTH)])
        .split(rows[1]);

    frame.render_widget(
        Paragraph::new(Span::styled(
            TITLE,
            Style::default().add_modifier(Modifier::BOLD),
        ))
        .block(Block::default().borders(Borders::ALL)),
        rows[0],
    );
    frame.render_widget(render_messages(screen, body[0]), body[0]);
    frame.render_widget(render_peers(screen), body[1]);
    render_input(frame, screen, rows[2]);
    frame.render_widget(
        Paragraph::new(USAGE).block(Block::default().borders(Borders::ALL).title("Usage")),
        rows[3],
    );
}

fn render_messages(screen: &Screen, area: Rect) -> Paragraph<'static> {
    // Keep the newest lines in view
    let visible = area.height.saturating_sub(2) as usize;
    let skip = screen.lines.len().saturating_sub(visible);
    let lines: Vec<Line> = screen.lines.iter().skip(skip).map(chat_line).collect();

    Paragraph::new(Text::from(lines)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("ChatRoom-{}", screen.room)),
    )
}

fn chat_line(line: &ChatLine) -> Line<'static> {
    let (prefix, color) = match line.kind {
        LineKind::Own => (format!("<{}>", line.sender), Color::Green),
        LineKind::Remote => (format!("<{}>", line.sender), Color::Blue),
        LineKind::Log(_) => (format!("({})", line.sender), Color::Red),
    };
    Line::from(vec![
        Span::styled(prefix, Style::default().fg(color)),
        Span::raw(" "),
        Span::raw(line.text.clone()),
    ])
}

fn render_peers(screen: &Screen) -> List<'static> {
    let items: Vec<ListItem> = screen
        .peers
        .iter()
        .map(|peer| {
            ListItem::new(Span::styled(
                peer.short(),
                Style::default().fg(Color::Yellow),
            ))
        })
        .collect();
    List::new(items).block(Block::default().borders(Borders::ALL).title("Peers"))
}

fn render_input(frame: &mut Frame, screen: &Screen, area: Rect) {
    let label = screen.input_label();
    let cursor_x = area.x + 1 + (label.chars().count() + screen.input.chars().count()) as u16;

    frame.render_widget(
        Paragraph::new(Line::from(vec![
            Span::styled(label, Style::default().fg(Color::Green)),
            Span::raw(screen.input.clone()),
        ]))
        .block(Block::default().borders(Borders::ALL)),
        area,
    );
    frame.set_cursor_position((cursor_x.min(area.right().saturating_sub(2)), area.y + 1));
}
