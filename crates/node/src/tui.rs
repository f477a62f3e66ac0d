use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use carrier::{Connection, ConnectionId, ConnectionState, InterfaceEvent, Role, TrafficStats};
use log::Level;
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};

const MAX_LOG_LINES: usize = 500;
const SCROLL_STEP: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
}

impl LogLine {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: Level::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
        }
    }

    /// Describes a connection-level event. Messages are not logged.
    pub fn from_event(event: &InterfaceEvent) -> Option<Self> {
        let line = match event {
            InterfaceEvent::IncomingConnection { id, addr } => {
                Self::info(format!("Connection request from {} ({})", addr, id))
            }
            InterfaceEvent::Connected { id, addr } => {
                Self::info(format!("{} connected to {}", id, addr))
            }
            InterfaceEvent::ConnectionFailed { id, addr, reason } => {
                Self::warn(format!("{} to {} failed: {}", id, addr, reason))
            }
            InterfaceEvent::Disconnected { id, addr, reason } => {
                Self::info(format!("{} ({}) disconnected: {}", id, addr, reason))
            }
            InterfaceEvent::Error { message } => Self::error(message.clone()),
            InterfaceEvent::Message { .. } => return None,
        };
        Some(line)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub role: Role,
    pub state: ConnectionState,
    pub rtt_ms: f32,
    pub loss_percent: f32,
    pub unacked: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub age_secs: u64,
}

impl ConnectionInfo {
    pub fn from_connection(connection: &Connection, now: Instant) -> Self {
        let stats = connection.stats();
        Self {
            id: connection.id(),
            addr: connection.addr(),
            role: connection.role(),
            state: connection.state(),
            rtt_ms: connection.rtt_ms(),
            loss_percent: stats.packet_loss_percent,
            unacked: connection.unacked_count(),
            bytes_sent: stats.lifetime.bytes_sent,
            bytes_received: stats.lifetime.bytes_received,
            age_secs: now.saturating_duration_since(connection.created()).as_secs(),
        }
    }
}

/// Everything one frame needs, snapshotted while the interface lock is held.
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub title: String,
    pub local_addr: SocketAddr,
    pub uptime_secs: u64,
    pub connections: Vec<ConnectionInfo>,
    pub lifetime: TrafficStats,
    pub last_second: TrafficStats,
    pub simulated_drops: u64,
    pub status: Vec<String>,
}

pub struct TuiState {
    log: VecDeque<LogLine>,
    /// Lines scrolled up from the bottom.
    scroll: usize,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            log: VecDeque::with_capacity(MAX_LOG_LINES),
            scroll: 0,
        }
    }

    pub fn push(&mut self, line: LogLine) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(LogLine::info(message));
    }

    pub fn scroll_up(&mut self) {
        self.scroll = (self.scroll + SCROLL_STEP).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(SCROLL_STEP);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }

    /// The lines that fit in `height` rows at the current scroll offset.
    fn visible(&self, height: usize) -> impl Iterator<Item = &LogLine> {
        let end = self.log.len().saturating_sub(self.scroll);
        let start = end.saturating_sub(height);
        self.log.range(start..end)
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, dashboard: &Dashboard) {
    let table_height = dashboard.connections.len().clamp(1, 8) as u16 + 3;
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(table_height),
            Constraint::Length(7),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], dashboard);
    render_connections(frame, chunks[1], dashboard);
    render_network(frame, chunks[2], dashboard);
    render_log(frame, chunks[3], state);
    render_help(frame, chunks[4]);
}

fn render_header(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let title = format!(
        " {} - Uptime: {} ",
        dashboard.title,
        format_duration(dashboard.uptime_secs)
    );

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let mut text = format!(
        "Local: {}  |  Connections: {}",
        dashboard.local_addr,
        dashboard.connections.len()
    );
    for status in &dashboard.status {
        text.push_str("  |  ");
        text.push_str(status);
    }

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_connections(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let block = Block::default()
        .title(" Connections ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let header = Row::new([
        "Id", "Address", "Role", "State", "RTT", "Loss", "Unacked", "Sent", "Recv", "Age",
    ])
    .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = dashboard.connections.iter().map(|info| {
        let state_color = match info.state {
            ConnectionState::Connected => Color::Green,
            ConnectionState::Disconnecting | ConnectionState::Disconnected => Color::Red,
            _ => Color::Yellow,
        };
        Row::new(vec![
            Cell::from(info.id.to_string()),
            Cell::from(info.addr.to_string()),
            Cell::from(format!("{:?}", info.role)),
            Cell::from(info.state.as_str()).style(Style::default().fg(state_color)),
            Cell::from(format!("{:.1}ms", info.rtt_ms)),
            Cell::from(format!("{:.1}%", info.loss_percent)).style(loss_style(info.loss_percent)),
            Cell::from(info.unacked.to_string()),
            Cell::from(format_bytes(info.bytes_sent)),
            Cell::from(format_bytes(info.bytes_received)),
            Cell::from(format_duration(info.age_secs)),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Min(21),
            Constraint::Length(10),
            Constraint::Length(13),
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Length(8),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
        ],
    )
    .header(header)
    .block(block);

    frame.render_widget(table, area);
}

fn render_network(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let total = &dashboard.lifetime;
    let recent = &dashboard.last_second;
    let lines = vec![
        Line::from(vec![
            Span::styled("Datagrams: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} sent / {} recv ({}/s / {}/s)",
                    total.datagrams_sent,
                    total.datagrams_received,
                    recent.datagrams_sent,
                    recent.datagrams_received
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Bytes: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} sent / {} recv ({}/s / {}/s)",
                    format_bytes(total.bytes_sent),
                    format_bytes(total.bytes_received),
                    format_bytes(recent.bytes_sent),
                    format_bytes(recent.bytes_received)
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Resent: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} messages  |  {} duplicates  |  {} bad packets",
                    total.messages_resent, total.duplicates, total.bad_packets
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Packet Loss: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{:.1}% ({} lost, {} dropped by simulator)",
                    total.loss_percent(),
                    total.datagrams_lost,
                    dashboard.simulated_drops
                ),
                loss_style(total.loss_percent()),
            ),
        ]),
    ];

    let paragraph = Paragraph::new(lines).block(block);
    frame.render_widget(paragraph, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let title = if state.scroll > 0 {
        format!(" Log (-{}) ", state.scroll)
    } else {
        " Log ".to_string()
    };
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .visible(height)
        .map(|line| {
            let color = match line.level {
                Level::Error => Color::Red,
                Level::Warn => Color::Yellow,
                Level::Info => Color::White,
                Level::Debug | Level::Trace => Color::DarkGray,
            };
            Line::from(vec![
                Span::styled(
                    format!("{:<5} ", line.level),
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                ),
                Span::styled(line.message.as_str(), Style::default().fg(color)),
            ])
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("q/ESC: quit  |  PgUp/PgDn: scroll log  |  End: follow log")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn loss_style(percent: f32) -> Style {
    Style::default().fg(if percent > 5.0 {
        Color::Red
    } else {
        Color::White
    })
}

pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
