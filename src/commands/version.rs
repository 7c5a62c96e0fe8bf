pub fn run() -> anyhow::Result<()> {
    println!("signal-processor {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
