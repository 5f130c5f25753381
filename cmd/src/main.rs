//! HAMSTR link node binary.
//!
//! Runs either side of the radio link: `client` mode opens a session to
//! the gateway and performs one request or note send; `serve` mode parks
//! on the TNC and answers inbound sessions with a demo payload handler
//! (the real gateway wires its NOSTR machinery into the same trait).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use hamstr_session::{
    open_session, open_vara_session, serve_vara_session, EventBus, PayloadHandler, PayloadKind,
    RequestKind, Responder, SessionHandle,
};
use hamstr_tnc::VaraModem;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use logging::LinkLogFormatter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Open a session to the remote station and run one exchange.
    Client,
    /// Answer inbound sessions until interrupted.
    Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RequestArg {
    Following,
    SpecificUser,
    Global,
    SearchText,
    SearchHashtag,
    SearchUser,
}

impl From<RequestArg> for RequestKind {
    fn from(arg: RequestArg) -> Self {
        match arg {
            RequestArg::Following => RequestKind::Following,
            RequestArg::SpecificUser => RequestKind::SpecificUser,
            RequestArg::Global => RequestKind::Global,
            RequestArg::SearchText => RequestKind::SearchText,
            RequestArg::SearchHashtag => RequestKind::SearchHashtag,
            RequestArg::SearchUser => RequestKind::SearchUser,
        }
    }
}

/// HAMSTR radio link node
#[derive(Parser, Debug)]
#[command(name = "hamstr-link", version, about)]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Which side of the link to run
    #[arg(long, value_enum, default_value_t = Mode::Client)]
    mode: Mode,

    /// Use the VARA modem instead of a KISS TNC
    #[arg(long)]
    vara: bool,

    /// Request kind for client mode
    #[arg(long, value_enum, default_value_t = RequestArg::Following)]
    request: RequestArg,

    /// Note count parameter sent with the request
    #[arg(long, default_value_t = 2)]
    count: u32,

    /// Extra request parameters (npub, search text, ...)
    #[arg(long)]
    params: Option<String>,

    /// Send the note JSON in this file instead of requesting
    #[arg(long)]
    note: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("hamstr_link={}", args.log_level).parse()?)
        .add_directive(format!("hamstr_session={}", args.log_level).parse()?)
        .add_directive(format!("hamstr_tnc={}", args.log_level).parse()?)
        .add_directive(format!("hamstr_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(LinkLogFormatter::new())
        .init();

    info!("Starting HAMSTR link node v{}", env!("CARGO_PKG_VERSION"));

    let cfg = Arc::new(config::load(&args.config)?);
    let bus = EventBus::new();
    logging::print_events(&bus);

    match args.mode {
        Mode::Client => run_client(args, cfg, bus).await,
        Mode::Serve => run_server(args, cfg, bus).await,
    }
}

async fn run_client(
    args: Args,
    cfg: Arc<hamstr_session::LinkConfig>,
    bus: Arc<EventBus>,
) -> anyhow::Result<()> {
    let handle = if args.vara {
        let modem = VaraModem::connect(
            &cfg.vara.host,
            cfg.vara.command_port,
            cfg.vara.data_port,
            &cfg.local_callsign,
            cfg.vara.bandwidth,
            false,
        )
        .await?;
        open_vara_session(modem, Arc::clone(&cfg), bus).await?
    } else {
        let tnc = cfg.transport.open(cfg.connection_attempt_timeout).await?;
        open_session(tnc, Arc::clone(&cfg), bus).await?
    };

    let outcome = run_exchange(&args, &handle).await;
    if let Err(e) = handle.close_session().await {
        warn!("close failed: {e}");
    }
    outcome
}

async fn run_exchange(args: &Args, handle: &SessionHandle) -> anyhow::Result<()> {
    match &args.note {
        Some(path) => {
            let note = tokio::fs::read(path).await?;
            handle.send_payload(PayloadKind::Note, Bytes::from(note)).await?;
            info!("Note accepted by gateway");
        }
        None => {
            let params = match &args.params {
                Some(extra) => format!("{}|{}", args.count, extra),
                None => args.count.to_string(),
            };
            let payload = handle
                .request_payload(args.request.into(), Bytes::from(params))
                .await?;
            info!("Received {} payload bytes", payload.len());
            println!("{}", String::from_utf8_lossy(&payload));
        }
    }
    Ok(())
}

async fn run_server(
    args: Args,
    cfg: Arc<hamstr_session::LinkConfig>,
    bus: Arc<EventBus>,
) -> anyhow::Result<()> {
    let handler = DemoHandler;

    if args.vara {
        loop {
            let modem = VaraModem::connect(
                &cfg.vara.host,
                cfg.vara.command_port,
                cfg.vara.data_port,
                &cfg.local_callsign,
                cfg.vara.bandwidth,
                true,
            )
            .await?;
            if let Err(e) =
                serve_vara_session(modem, Arc::clone(&cfg), Arc::clone(&bus), &handler).await
            {
                warn!("VARA session ended with error: {e}");
            }
        }
    }

    let tnc = cfg.transport.open(cfg.connection_attempt_timeout).await?;
    let mut responder = Responder::new(tnc, Arc::clone(&cfg), bus);
    loop {
        match responder.serve_one(&handler).await {
            Ok(()) => info!("Session complete, waiting for the next station"),
            Err(e) => warn!("Session ended with error: {e}"),
        }
    }
}

/// Stand-in gateway logic so a bare node can answer the whole protocol.
struct DemoHandler;

#[async_trait]
impl PayloadHandler for DemoHandler {
    async fn handle_request(&self, kind: RequestKind, params: Bytes) -> Result<Bytes, String> {
        info!(
            "Demo handler answering {kind:?} ({} parameter bytes)",
            params.len()
        );
        Ok(Bytes::from(format!(
            "[{{\"kind\":\"{kind:?}\",\"content\":\"demo note from the gateway\"}}]"
        )))
    }

    async fn handle_note(&self, note: Bytes) -> Result<(), String> {
        info!("Demo handler received a {} byte note", note.len());
        Ok(())
    }

    async fn handle_zap_request(&self, _request: Bytes) -> Result<Bytes, String> {
        Err("zaps are not configured on this gateway".to_string())
    }

    async fn handle_payment(&self, _request: Bytes) -> Result<Bytes, String> {
        Err("wallet connect is not configured on this gateway".to_string())
    }

    async fn handle_zap_confirm(&self, _confirm: Bytes) -> Result<(), String> {
        Ok(())
    }
}
