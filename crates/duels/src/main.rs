use duels::{get_settings, setup_logger, Application};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = get_settings()?;

    // Demote the chatty transport crates; their warnings still surface
    let quiet = ["hyper", "reqwest", "sqlx", "tungstenite"]
        .map(String::from)
        .to_vec();
    setup_logger(settings.level.clone(), quiet)?;

    Application::build(settings).await?.run_until_stopped().await
}
