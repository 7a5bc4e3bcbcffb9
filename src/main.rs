mod cli;

use std::cell::Cell;
use std::ffi::c_int;
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use cli::{Cli, Command};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing_subscriber::EnvFilter;
use xfer::format::{unwrap, wrap};
use xfer::{
    AppContext, AsyncRequest, CancelHandle, DataFormat, DataOffer, DataSource, EventPump,
    ExchangeConfig, ExchangeData, ExchangeError, LoopControl, MemorySource, WaitError,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for the selection owner")]
    TimedOut,

    #[error("{0} is empty")]
    NoOwner(&'static str),

    #[error("no {format} data on the {selection}")]
    NoData {
        format: DataFormat,
        selection: &'static str,
    },

    #[error("could not take the {0}")]
    Refused(&'static str),
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// SIGINT ends `copy` cleanly. No `SA_RESTART`, so a blocked poll
/// returns and the loop sees the flag.
fn install_interrupt_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}

/// Pump that interrupts the wait it serves once a deadline has passed.
struct DeadlinePump {
    inner: LoopControl,
    deadline: Instant,
    cancel: CancelHandle,
    expired: Cell<bool>,
}

impl EventPump for DeadlinePump {
    fn pump(&self) -> Result<(), ExchangeError> {
        if Instant::now() >= self.deadline {
            self.expired.set(true);
            self.cancel.cancel();
            return Ok(());
        }
        self.inner.pump_once()
    }
}

fn wait<R>(
    ctx: &AppContext,
    request: AsyncRequest<R>,
    timeout: Option<Duration>,
) -> Result<R, CliError> {
    let Some(timeout) = timeout else {
        return Ok(request.wait(ctx.loop_control(), None)?);
    };
    let cancel = CancelHandle::new();
    let pump = Rc::new(DeadlinePump {
        inner: ctx.loop_control().clone(),
        deadline: Instant::now() + timeout,
        cancel: cancel.clone(),
        expired: Cell::new(false),
    });
    let control = LoopControl::new(pump.clone());
    match request.wait(&control, Some(&cancel)) {
        Err(WaitError::Cancelled) if pump.expired.get() => Err(CliError::TimedOut),
        other => Ok(other?),
    }
}

fn selection_name(primary: bool) -> &'static str {
    if primary { "primary selection" } else { "clipboard" }
}

fn offer(ctx: &AppContext, primary: bool) -> Result<Rc<dyn DataOffer>, CliError> {
    let offer = if primary { ctx.primary() } else { ctx.clipboard() };
    offer.ok_or(CliError::NoOwner(selection_name(primary)))
}

fn copy(ctx: &AppContext, format: DataFormat, primary: bool) -> Result<(), CliError> {
    let mut input = Vec::new();
    std::io::stdin().read_to_end(&mut input)?;
    let data = wrap(&input, &format);
    if data.is_empty() {
        return Err(CliError::NoData {
            format,
            selection: "standard input",
        });
    }
    let source: Rc<dyn DataSource> = Rc::new(MemorySource::new().with(format.clone(), data));

    let claimed = if primary {
        ctx.primary_set(Some(source))
    } else {
        ctx.clipboard_set(Some(source))
    };
    if !claimed {
        return Err(CliError::Refused(selection_name(primary)));
    }
    install_interrupt_handler().map_err(ExchangeError::from)?;
    tracing::info!(format = %format, bytes = input.len(), primary, "serving selection");

    let owns = || if primary { ctx.owns_primary() } else { ctx.owns_clipboard() };
    while owns() && !INTERRUPTED.load(Ordering::SeqCst) {
        if let Err(e) = ctx.dispatch() {
            if e.is_fatal() {
                return Err(e.into());
            }
            tracing::warn!(error = %e, "event dispatch failed");
        }
    }
    if INTERRUPTED.load(Ordering::SeqCst) {
        tracing::info!("interrupted, giving up the selection");
    } else {
        tracing::info!("selection taken by another client");
    }
    Ok(())
}

fn paste(
    ctx: &AppContext,
    format: DataFormat,
    primary: bool,
    timeout: Option<Duration>,
) -> Result<(), CliError> {
    let offer = offer(ctx, primary)?;
    let data = wait(ctx, offer.data(&format), timeout)?;
    let bytes = match &data {
        ExchangeData::Empty => None,
        ExchangeData::Text(text) => Some(text.clone().into_bytes()),
        ExchangeData::UriList(uris) => Some(
            uris.iter()
                .flat_map(|uri| format!("{uri}\n").into_bytes())
                .collect(),
        ),
        _ => unwrap(&data, &format),
    };
    let Some(bytes) = bytes else {
        return Err(CliError::NoData {
            format,
            selection: selection_name(primary),
        });
    };
    let mut out = std::io::stdout().lock();
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

fn targets(ctx: &AppContext, primary: bool, timeout: Option<Duration>) -> Result<(), CliError> {
    let offer = offer(ctx, primary)?;
    let formats = wait(ctx, offer.formats(), timeout)?;
    let mut out = std::io::stdout().lock();
    for format in formats {
        writeln!(out, "{format}")?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ExchangeConfig {
        backend: cli.backend,
        timeout_ms: cli.timeout_ms,
        ..ExchangeConfig::default()
    };
    let timeout = config.timeout_ms.map(Duration::from_millis);

    let ctx = match AppContext::connect(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "connect failed");
            eprintln!("xfer: {e}");
            std::process::exit(1);
        }
    };

    let (name, result) = match cli.command {
        Command::Copy { format, primary } => ("copy", copy(&ctx, format, primary)),
        Command::Paste { format, primary } => ("paste", paste(&ctx, format, primary, timeout)),
        Command::Targets { primary } => ("targets", targets(&ctx, primary, timeout)),
    };
    ctx.shutdown();

    if let Err(e) = result {
        tracing::error!(command = name, error = %e, "command failed");
        eprintln!("xfer {name}: {e}");
        std::process::exit(1);
    }
}
