use chatsync::{CacheHandle, Config};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let config = Config::resolve();
    let path = config.database_path();

    let cache = match CacheHandle::open(&path) {
        Ok(cache) => cache,
        Err(e) => {
            log::error!("Failed to open cache at {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };

    let version = match cache.schema_version().await {
        Ok(v) => v,
        Err(e) => {
            log::error!("Failed to read schema version: {}", e);
            std::process::exit(1);
        }
    };
    println!("cache: {}", path.display());
    println!("schema version: {}", version);

    let pending = match cache.all_pending().await {
        Ok(pending) => pending,
        Err(e) => {
            log::error!("Failed to read outbox: {}", e);
            std::process::exit(1);
        }
    };
    if pending.is_empty() {
        println!("outbox: empty");
        return;
    }

    println!("outbox: {} entr{}", pending.len(), if pending.len() == 1 { "y" } else { "ies" });
    for entry in pending {
        println!(
            "  {}  conversation={}  retries={}  parked={}  last_error={}",
            entry.local_id,
            entry.conversation_id,
            entry.retry_count,
            entry.parked,
            entry.last_error.as_deref().unwrap_or("-")
        );
    }
}
