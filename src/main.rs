use ffmpeg_next::{self as ffmpeg};
use tracing_subscriber::EnvFilter;
use video_snapshot::Config;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    ffmpeg::init().unwrap();

    // Load configuration from CLI and/or config file
    let config = Config::load().expect("Failed to load configuration");
    video_snapshot::run(config).await
}
