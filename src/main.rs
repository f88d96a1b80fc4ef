#[tokio::main]
async fn main() -> anyhow::Result<()> {
    webpilot_lib::run().await?;
    Ok(())
}
