use pourover::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = cli::load_config(&cli)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.log.level.as_str()))
        .init();
    log::debug!("config: feed api at {}", cfg.api.base_url);
    cli::run(cli, &cfg)
}
