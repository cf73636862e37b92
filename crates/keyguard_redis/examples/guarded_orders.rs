//! Rate limits order placement per customer and serialises work per order against a local Redis.
//!
//! ```sh
//! KEYGUARD_KEY_PREFIX=demo RUST_LOG=debug cargo run -p keyguard_redis --example guarded_orders
//! ```

use std::{env, time::Duration};

use keyguard_core::{
    GuardError,
    intercept::{LockPolicy, Parameters, RateLimitPolicy, TimeUnit},
};
use keyguard_redis::{RedisStoreConfig, connect_interceptor};
use serde_json::json;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let default_log_filter = "info,keyguard_core=debug,keyguard_redis=debug";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    let config = RedisStoreConfig::from_env();
    info!(url = %config.url, prefix = %config.key_prefix, "Connecting.");
    let guard = connect_interceptor(&config).await?;
    info!(
        strategy = guard.rate_limiter().strategy().as_str(),
        "Rate limiter ready."
    );

    let per_customer = RateLimitPolicy::builder()
        .key("orders:${order.customer}")
        .quota(3)
        .period(10)
        .period_unit(TimeUnit::Seconds)
        .message("order rate exceeded, retry in a few seconds")
        .build();
    let per_order = LockPolicy::builder()
        .key("order:${order.id}")
        .expire(5)
        .retries(10)
        .retry_interval(200)
        .build();

    for id in 1..=5 {
        let parameters = Parameters::new().with("order", json!({ "id": id, "customer": "c-42" }));

        let placed = match guard.check_rate_limit(&per_customer, &parameters).await {
            Ok(()) => {
                guard
                    .locked(&per_order, &parameters, async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, std::io::Error>(id)
                    })
                    .await
            }
            Err(error) => Err(error),
        };

        match placed {
            Ok(id) => info!(id, "Order placed."),
            Err(error) if error.is_rejection() => warn!(id, %error, "Order rejected."),
            Err(error) => return Err(error.into()),
        }
    }

    Ok(())
}
