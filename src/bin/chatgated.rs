//! Gateway server daemon.

use chatgate::chatgate::server::{serve, Application};
use chatgate::chatgate::settings::Settings;

#[tokio::main]
async fn main() {
    chatgate::init_logger();

    let settings = Settings::load();
    let app = match Application::bootstrap(settings).await {
        Ok(app) => app,
        Err(e) => {
            log::error!("bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(app).await {
        log::error!("server exited with error: {}", e);
        std::process::exit(1);
    }
}
