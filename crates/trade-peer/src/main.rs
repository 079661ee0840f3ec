//! `lantrade`: LAN trade peer entry point.
//!
//! Wires together preferences, the wallet, listing discovery, the TCP
//! transport, and the negotiation session, then drives an interactive
//! negotiation from stdin.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_preferences()            -- settings + balances (TOML)
//!  └─ subcommand
//!       ├─ profile  -> set name / deposit, save
//!       ├─ browse   -> discovery::browse() for a few seconds
//!       ├─ sell     -> publish() + PeerListener::accept() -> negotiate()
//!       └─ buy      -> browse until seller found -> connect() -> negotiate()
//! negotiate()
//!  └─ PeerSession::from_tcp()       -- receive loop task
//!  └─ select! over session events and stdin commands
//!  └─ wallet.settle() or wallet.release()
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    time,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trade_core::{describe, role_label, Listing, NegotiationSession, Outcome, Role};
use trade_peer::application::{
    negotiate::{Command as UserCommand, NegotiateUseCase},
    wallet::{parse_amount, BalanceStore, Wallet},
};
use trade_peer::infrastructure::{
    network::{
        browse, connect, discovery::is_foreign, publish, AdapterConfig, DiscoveredListing,
        PeerListener, PeerSession, SessionEvent,
    },
    storage::config::{
        load_preferences, preferences_path, save_preferences, Preferences, PreferencesStore,
    },
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Negotiate BTC/USD trades with peers on the local network.
#[derive(Debug, Parser)]
#[command(name = "lantrade", version, about)]
struct Cli {
    /// Preferences file (defaults to the platform config directory).
    #[arg(long, env = "LANTRADE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the stored display name for this run.
    #[arg(long, env = "LANTRADE_USER")]
    user: Option<String>,

    /// Overrides the stored connection passcode.
    #[arg(long, env = "LANTRADE_PASSCODE")]
    passcode: Option<String>,

    /// Overrides the TCP port a seller listens on (0 picks a free port).
    #[arg(long, env = "LANTRADE_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Set the display name and optionally deposit demo funds.
    Profile {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 0.0)]
        deposit_btc: f64,
        #[arg(long, default_value_t = 0.0)]
        deposit_usd: f64,
    },
    /// Print listings announced on the network.
    Browse {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Publish a listing and negotiate with the first buyer that connects.
    Sell {
        #[arg(long)]
        price: String,
        #[arg(long)]
        amount: String,
    },
    /// Find a seller's listing and open a negotiation.
    Buy {
        #[arg(long)]
        seller: String,
        /// Seconds to wait for the seller's announcement.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

impl Cli {
    fn apply_overrides(&self, prefs: &mut Preferences) {
        if let Some(user) = &self.user {
            prefs.user_name = user.clone();
        }
        if let Some(passcode) = &self.passcode {
            prefs.passcode = passcode.clone();
        }
        if let Some(port) = self.port {
            prefs.control_port = port;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => preferences_path().context("no preferences location; pass --config")?,
    };
    let stored = load_preferences(&path)
        .with_context(|| format!("failed to load preferences from {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(stored.log_level.clone())),
        )
        .init();

    let mut prefs = stored.clone();
    cli.apply_overrides(&mut prefs);

    match cli.command {
        Command::Profile {
            name,
            deposit_btc,
            deposit_usd,
        } => {
            let mut updated = stored;
            updated.set_user_name(name);
            updated.balance_btc += deposit_btc;
            updated.balance_usd += deposit_usd;
            save_preferences(&path, &updated)
                .with_context(|| format!("failed to save {}", path.display()))?;
            println!(
                "Profile '{}' saved. Balance: BTC{} / USD{}",
                updated.user_name, updated.balance_btc, updated.balance_usd
            );
            Ok(())
        }
        Command::Browse { seconds } => run_browse(&prefs, Duration::from_secs(seconds)).await,
        Command::Sell { price, amount } => {
            require_profile(&prefs)?;
            let listing = Listing::new(prefs.user_name.clone(), price, amount);
            run_sell(path, prefs, listing).await
        }
        Command::Buy { seller, timeout } => {
            require_profile(&prefs)?;
            run_buy(path, prefs, &seller, Duration::from_secs(timeout)).await
        }
    }
}

fn require_profile(prefs: &Preferences) -> anyhow::Result<()> {
    if !prefs.has_profile() {
        bail!("no display name set; run `lantrade profile --name <name>` first");
    }
    Ok(())
}

fn discovery_bind(prefs: &Preferences) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], prefs.discovery_port))
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_browse(prefs: &Preferences, window: Duration) -> anyhow::Result<()> {
    let mut rx = browse(discovery_bind(prefs)).await?;
    let mut seen: BTreeMap<String, DiscoveredListing> = BTreeMap::new();
    let deadline = time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            found = rx.recv() => match found {
                Some(found) if is_foreign(&found, &prefs.user_name) => {
                    seen.insert(found.listing.name.clone(), found);
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    if seen.is_empty() {
        println!("No listings found.");
    }
    for found in seen.values() {
        println!(
            "{:<16} BTC{} @ USD{}  ({})",
            found.listing.name, found.listing.amount, found.listing.price, found.address
        );
    }
    Ok(())
}

async fn run_sell(path: PathBuf, prefs: Preferences, listing: Listing) -> anyhow::Result<()> {
    let mut wallet = Wallet::new(PreferencesStore::new(path, &prefs), prefs.rate);
    wallet.offer_sell(parse_amount(&listing.amount)?)?;

    let bind = SocketAddr::from(([0, 0, 0, 0], prefs.control_port));
    let listener = PeerListener::bind(bind, prefs.passcode.clone()).await?;
    let port = listener.local_addr()?.port();
    let publisher = publish(
        listing.clone(),
        port,
        prefs.announce_socket_addr()?,
        prefs.announce_interval(),
    )
    .await?;

    println!(
        "Listing BTC{} @ USD{} as '{}'. Waiting for a buyer…",
        listing.amount, listing.price, listing.name
    );
    let accepted = tokio::select! {
        accepted = listener.accept() => Some(accepted?),
        _ = tokio::signal::ctrl_c() => None,
    };
    publisher.unpublish().await;

    let Some((stream, addr)) = accepted else {
        wallet.release();
        println!("Listing withdrawn.");
        return Ok(());
    };
    info!("buyer connected from {addr}");

    let session = NegotiationSession::new(listing, prefs.user_name.clone());
    negotiate(session, stream, &prefs, &mut wallet).await
}

async fn run_buy(
    path: PathBuf,
    prefs: Preferences,
    seller: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut rx = browse(discovery_bind(&prefs)).await?;
    let found = time::timeout(timeout, async {
        while let Some(found) = rx.recv().await {
            if found.listing.name == seller {
                return Some(found);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .with_context(|| format!("no listing from '{seller}' seen within {timeout:?}"))?;
    drop(rx);

    let mut wallet = Wallet::new(PreferencesStore::new(path, &prefs), prefs.rate);
    wallet.offer_buy(parse_amount(&found.listing.amount)?)?;

    let stream = connect(found.address, &prefs.passcode).await?;
    let session = NegotiationSession::new(found.listing, prefs.user_name.clone());
    negotiate(session, stream, &prefs, &mut wallet).await
}

// ── Interactive negotiation ───────────────────────────────────────────────────

async fn negotiate<S: BalanceStore>(
    session: NegotiationSession,
    stream: TcpStream,
    prefs: &Preferences,
    wallet: &mut Wallet<S>,
) -> anyhow::Result<()> {
    let role = session.role();
    let config = AdapterConfig {
        max_payload_bytes: prefs.max_payload_bytes,
        ..Default::default()
    };
    let (peer, mut events, task) = PeerSession::from_tcp(session, stream, config);
    let use_case = NegotiateUseCase::new(peer.clone());

    println!(
        "{}: counter <price> <amount> | accept | reject | quit",
        role_label(role)
    );
    if role == Role::Buyer {
        use_case.open().await.context("failed to send intent")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::MessageReceived(msg)) => {
                    if let Some(line) = describe(&msg, role) {
                        println!("{line}");
                    }
                }
                Some(SessionEvent::Violation(v)) => warn!("peer broke the rules: {v}"),
                Some(SessionEvent::Unrecognized { type_code }) => {
                    warn!("ignored message of type {type_code}")
                }
                Some(SessionEvent::Failed(reason)) => println!("Connection failed: {reason}"),
                Some(SessionEvent::Ready) => {}
                Some(SessionEvent::Closed) | None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match UserCommand::parse(&line) {
                    Ok(command) => {
                        if let Err(e) = use_case.execute(&command).await {
                            println!("{e}");
                        }
                    }
                    Err(e) => println!("{e}"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = use_case.execute(&UserCommand::Quit).await {
                    warn!("could not resign cleanly: {e}");
                }
                peer.shutdown().await;
            }
        }

        let state = peer.shared_session();
        let state = state.lock().await;
        let finished = state.settlement().is_some()
            || matches!(state.outcome(), Some(Outcome::Rejected | Outcome::Resigned));
        drop(state);
        if finished {
            peer.shutdown().await;
        }
    }
    if let Err(e) = task.await {
        warn!("receive loop ended abnormally: {e}");
    }

    let state = peer.shared_session();
    let state = state.lock().await;
    match (state.outcome(), state.settlement()) {
        (Some(Outcome::Accepted), Some(terms)) => {
            let balances = wallet.settle(role, terms)?;
            println!(
                "Trade settled at {terms}. Balance: BTC{} / USD{}",
                balances.btc, balances.usd
            );
        }
        (outcome, _) => {
            wallet.release();
            println!("Negotiation ended: {}", outcome_text(outcome));
        }
    }
    Ok(())
}

fn outcome_text(outcome: Option<Outcome>) -> &'static str {
    match outcome {
        Some(Outcome::Accepted) => "accepted, but no summary arrived",
        Some(Outcome::Rejected) => "rejected",
        Some(Outcome::Resigned) => "a party left",
        None => "connection closed",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
