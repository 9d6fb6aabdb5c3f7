use clap::Parser;
use tracing_subscriber::EnvFilter;
use videojockey::app;
use videojockey::audio;
use videojockey::config::Config;
use videojockey::effects::builtin_effects;

fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();

    // Logs go to stderr so they never land inside the alternate screen;
    // redirect stderr to a file to watch them live.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cfg.list_devices {
        return audio::list_input_devices();
    }

    if cfg.list_effects {
        println!("Effects:");
        for desc in builtin_effects() {
            if desc.capabilities.is_empty() {
                println!("  - {}", desc.name);
            } else {
                println!("  - {} (requires {:?})", desc.name, desc.capabilities);
            }
        }
        return Ok(());
    }

    app::run(cfg)
}
