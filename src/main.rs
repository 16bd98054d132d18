use anyhow::{bail, Context, Result};
use deauth_collector::{config::SinkKind, logging, platform, simulator, AppConfig, Service};

#[derive(Debug)]
struct Cli {
    config_path: String,
    replay_path: Option<String>,
    console: bool,
}

impl Cli {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut config_path: Option<String> = None;
        let mut replay_path: Option<String> = None;
        let mut console = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                    config_path = Some(value);
                }
                "--replay" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--replay requires a path"))?;
                    replay_path = Some(value);
                }
                "--console" => console = true,
                "--help" | "-h" => {
                    println!(
                        "Usage: deauth-collector [--config <path>] [--replay <capture>] [--console]\n\
                         --config <path>    Path to TOML configuration (default: config/deauth-collector.toml)\n\
                         --replay <path>    Ingest a binary capture file instead of the serial link\n\
                         --console          Print events instead of writing the configured sink"
                    );
                    std::process::exit(0);
                }
                other => {
                    if config_path.is_none() {
                        config_path = Some(other.to_string());
                    } else {
                        bail!("unknown argument '{other}'");
                    }
                }
            }
        }

        Ok(Self {
            config_path: config_path.unwrap_or_else(|| AppConfig::default_path().into()),
            replay_path,
            console,
        })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse()?;

    let config = AppConfig::load(&cli.config_path)
        .with_context(|| format!("unable to load configuration from {}", cli.config_path))?;

    let _log_guard = logging::init(&config)?;
    platform::log_platform_guidance();

    let sink = if cli.console {
        SinkKind::Console
    } else {
        config.sink
    };

    if let Some(capture) = cli.replay_path {
        tracing::info!(capture = %capture, sink = ?sink, "replaying binary capture");
        simulator::replay_capture(capture, &config, sink).await?;
        Ok(())
    } else {
        Service::new(config).with_sink(sink).run().await
    }
}
