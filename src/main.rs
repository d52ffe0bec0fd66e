#[tokio::main]
async fn main() -> anyhow::Result<()> {
    oven_tracker_lib::run().await
}
