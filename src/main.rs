use subtrans::config::Cli;
use subtrans::run;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,subtrans=info".into()),
        )
        .init();

    let cli = <Cli as clap::Parser>::parse();
    run(cli)
}
