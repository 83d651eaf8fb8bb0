use tracing_subscriber::EnvFilter;

mod commands;

fn main() {
    let filter = EnvFilter::try_from_env("HARIMU_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    commands::run();
}
