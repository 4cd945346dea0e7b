fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("coinscope-server [start]");
        println!();
        println!("Runs the analytics core until SIGINT/SIGTERM.");
        println!("Configuration comes from the environment (see .env):");
        println!("  COINSCOPE_DATABASE_URL, COINSCOPE_SYMBOLS,");
        println!("  EXCHANGE_API_KEY, EXCHANGE_API_SECRET,");
        println!("  REDIS_URL, CACHE_DB_INDEX");
        return Ok(());
    }

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(coinscope_server::run())?;

    std::process::exit(exit_code);
}
