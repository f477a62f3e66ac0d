mod client;
mod config;
mod net;
mod server;
mod tui;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use carrier::{PacketLossSimulation, Reliability};
use client::{ClientPlan, TestClient};
use config::NodeConfig;
use server::EchoServer;
use tui::{Dashboard, LogLine, TuiState};

#[derive(Parser)]
#[command(name = "carrier-node")]
#[command(about = "Echo server and load client for the carrier transport")]
struct Args {
    #[arg(short, long, help = "TOML file with [carrier] and [simulation] tables")]
    config: Option<PathBuf>,

    #[arg(long)]
    headless: bool,

    #[command(flatten)]
    simulation: SimulationArgs,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(ClapArgs)]
struct SimulationArgs {
    #[arg(long, global = true, help = "Enable packet loss simulation on sends")]
    simulate_packet_loss: bool,

    #[arg(long, global = true, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, global = true, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, global = true, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, global = true, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and echo every message back
    Listen {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, default_value_t = carrier::DEFAULT_PORT)]
        port: u16,

        #[arg(short, long)]
        max_connections: Option<usize>,
    },
    /// Connect to an echo server and measure round trips
    Connect {
        host: String,

        #[arg(short, long, default_value_t = carrier::DEFAULT_PORT)]
        port: u16,

        #[arg(short = 'n', long, default_value_t = 100)]
        count: u32,

        #[arg(short, long, default_value_t = 50)]
        interval_ms: u64,

        #[arg(short, long, help = "Send on the unreliable channel")]
        unreliable: bool,

        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },
}

/// A node driven by the headless loop or the dashboard.
trait Node {
    fn tick_once(&mut self) -> Vec<LogLine>;

    fn running(&self) -> Arc<AtomicBool>;

    fn tick_interval(&self) -> Duration;

    fn dashboard(&self) -> Dashboard;

    fn shutdown(&mut self) -> Vec<LogLine>;
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if args.simulation.simulate_packet_loss {
        config.simulation = PacketLossSimulation {
            enabled: true,
            loss_percent: args.simulation.loss_percent,
            min_latency_ms: args.simulation.min_latency,
            max_latency_ms: args.simulation.max_latency,
            jitter_ms: args.simulation.jitter,
        };
    }

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match args.mode {
        Mode::Listen {
            bind,
            port,
            max_connections,
        } => {
            if let Some(max) = max_connections {
                config.carrier.max_connections = max;
                config.carrier.validate()?;
            }
            let mut server = EchoServer::new(&format!("{}:{}", bind, port), &config)?;
            let started = format!("Echo server listening on {}", server.local_addr());
            run(&mut server, args.headless, started)?;
        }
        Mode::Connect {
            host,
            port,
            count,
            interval_ms,
            unreliable,
            size,
        } => {
            let server_addr = carrier::resolve_address(&host, port)?;
            let plan = ClientPlan {
                count,
                interval: Duration::from_millis(interval_ms),
                reliability: if unreliable {
                    Reliability::Unreliable
                } else {
                    Reliability::Reliable
                },
                size,
            };
            let mut client = TestClient::new(server_addr, plan, &config)?;
            let started = format!("Connecting to {}", server_addr);
            run(&mut client, args.headless, started)?;
            if !args.headless {
                for line in client.summary() {
                    println!("{}", line);
                }
            }
        }
    }

    Ok(())
}

fn run<N: Node>(node: &mut N, headless: bool, started: String) -> io::Result<()> {
    if headless {
        run_headless(node, started);
        Ok(())
    } else {
        run_with_tui(node, started)
    }
}

fn emit(line: &LogLine) {
    log::log!(line.level, "{}", line.message);
}

fn run_headless<N: Node>(node: &mut N, started: String) {
    log::info!("{}", started);
    let running = node.running();
    let tick_interval = node.tick_interval();

    while running.load(Ordering::SeqCst) {
        for line in node.tick_once() {
            emit(&line);
        }
        std::thread::sleep(tick_interval);
    }

    for line in node.shutdown() {
        emit(&line);
    }
}

fn run_with_tui<N: Node>(node: &mut N, started: String) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = node.running();
    let tick_interval = node.tick_interval();
    let mut tui_state = TuiState::new();

    tui_state.log_info(started);

    while running.load(Ordering::SeqCst) {
        for line in node.tick_once() {
            tui_state.push(line);
        }

        if event::poll(tick_interval)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            running.store(false, Ordering::SeqCst);
                        }
                        KeyCode::PageUp => tui_state.scroll_up(),
                        KeyCode::PageDown => tui_state.scroll_down(),
                        KeyCode::End => tui_state.scroll_to_bottom(),
                        _ => {}
                    }
                }
            }
        }

        let dashboard = node.dashboard();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &dashboard);
        })?;
    }

    for line in node.shutdown() {
        tui_state.push(line);
    }
    let dashboard = node.dashboard();
    terminal.draw(|frame| {
        tui::render(frame, &tui_state, &dashboard);
    })?;

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
