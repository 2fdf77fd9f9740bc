use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use yakphone::domain::call::CallEvent;
use yakphone::domain::client::ClientEvent;
use yakphone::infrastructure::dns::DnsResolver;
use yakphone::infrastructure::media::{key_tone, NullAudioDevices};
use yakphone::{Phone, PhoneConfig, PhoneHandle};

#[derive(Parser)]
#[command(name = "yakphone", version, about = "SIP softphone")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register and stay registered until interrupted
    Register,
    /// Register, call a SIP address and hang up on Ctrl-C
    Dial {
        /// Recipient, e.g. `sip:bob@example.com`
        recipient: String,
        /// Keys to send as DTMF once the call connects, e.g. `123#`
        #[arg(long)]
        dtmf: Option<String>,
    },
    /// Register and wait for incoming calls
    Listen {
        /// Answer incoming calls without asking
        #[arg(long)]
        auto_answer: bool,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PhoneConfig::load(cli.config.as_deref())?;

    if let Command::PrintConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting yakphone {}", env!("CARGO_PKG_VERSION"));
    if config.account.domain.is_empty() || config.account.username.is_empty() {
        anyhow::bail!("account.domain and account.username must be configured");
    }

    let resolver = Arc::new(DnsResolver::from_system_conf()?);
    let (phone, handle, mut events) =
        Phone::bind(config, resolver, Arc::new(NullAudioDevices::default())).await?;
    let driver = tokio::spawn(phone.run());

    let mut session = Session {
        handle,
        command: cli.command,
        dialed: None,
        stopping: false,
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => session.handle_event(event).await?,
                None => break,
            },
            result = tokio::signal::ctrl_c(), if !session.stopping => {
                result?;
                info!("Shutting down...");
                session.stop().await?;
            }
        }
    }

    driver.await??;
    Ok(())
}

struct Session {
    handle: PhoneHandle,
    command: Command,
    /// Call placed by `dial`
    dialed: Option<String>,
    stopping: bool,
}

impl Session {
    async fn stop(&mut self) -> anyhow::Result<()> {
        self.stopping = true;
        self.handle.disconnect().await?;
        Ok(())
    }

    async fn handle_event(&mut self, event: ClientEvent) -> anyhow::Result<()> {
        match event {
            ClientEvent::Connected => {
                info!("Registered");
                if let Command::Dial { recipient, .. } = &self.command {
                    if self.dialed.is_none() && !self.stopping {
                        let call_id = self.handle.dial(recipient.as_str()).await?;
                        info!("Calling {} (call {})", recipient, call_id);
                        self.dialed = Some(call_id);
                    }
                }
            }
            ClientEvent::Disconnected => {
                if !self.stopping {
                    warn!("Not registered, retrying");
                }
            }
            ClientEvent::CallReceived { call_id, from } => {
                info!("Incoming call {} from {}", call_id, from);
                if let Command::Listen { auto_answer: true } = self.command {
                    if let Err(e) = self.handle.accept(&call_id).await {
                        warn!("Could not answer call {}: {}", call_id, e);
                    }
                }
            }
            ClientEvent::Call { call_id, event } => match event {
                CallEvent::Ringing => info!("Call {} ringing", call_id),
                CallEvent::Connected => {
                    info!("Call {} connected", call_id);
                    if let Command::Dial { dtmf: Some(keys), .. } = &self.command {
                        if self.dialed.as_deref() == Some(call_id.as_str()) {
                            tokio::spawn(send_keys(self.handle.clone(), keys.clone()));
                        }
                    }
                }
                CallEvent::Finished => {
                    info!("Call {} finished", call_id);
                    if let Err(e) = self.handle.release(&call_id).await {
                        warn!("Could not release call {}: {}", call_id, e);
                    }
                    if self.dialed.as_deref() == Some(call_id.as_str()) && !self.stopping {
                        self.stop().await?;
                    }
                }
                CallEvent::StateChanged(_) => {}
            },
            ClientEvent::StateChanged(_)
            | ClientEvent::CallStarted { .. }
            | ClientEvent::ActiveCallsChanged(_) => {}
        }
        Ok(())
    }
}

const KEY_PRESS: Duration = Duration::from_millis(160);
const KEY_GAP: Duration = Duration::from_millis(100);

/// Play `keys` as DTMF tones, one after the other
async fn send_keys(handle: PhoneHandle, keys: String) {
    for key in keys.chars() {
        let Some(tone) = key_tone(key) else {
            warn!("Skipping '{}', not a DTMF key", key);
            continue;
        };
        if let Err(e) = handle.start_tone(tone).await {
            warn!("Could not send DTMF '{}': {}", key, e);
            return;
        }
        tokio::time::sleep(KEY_PRESS).await;
        if let Err(e) = handle.stop_tone(tone).await {
            warn!("Could not send DTMF '{}': {}", key, e);
            return;
        }
        tokio::time::sleep(KEY_GAP).await;
    }
}
