#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use optimizely_sdk::{Client, ConfigBuilder, DecideOption, ServiceEndpointsBuilder};

use env_logger::Env;
use serde_json::json;
use tokio::time;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(Env::new().default_filter_or("info"));

    let flags: Vec<String> = env::args().skip(1).collect();
    if flags.is_empty() {
        error!("Please list some flags to watch.");
        exit(1);
    }

    let sdk_key = env::var("OPTIMIZELY_SDK_KEY").expect("Please set OPTIMIZELY_SDK_KEY");
    let datafile_url_opt = env::var("OPTIMIZELY_DATAFILE_URL_TEMPLATE");
    let events_url_opt = env::var("OPTIMIZELY_EVENTS_URL");

    let mut config_builder = ConfigBuilder::new(&sdk_key);
    match (datafile_url_opt, events_url_opt) {
        (Ok(datafile_url), Ok(events_url)) => {
            config_builder = config_builder.service_endpoints(
                ServiceEndpointsBuilder::new()
                    .datafile_url_template(&datafile_url)
                    .events_url(&events_url),
            );
        }
        // If neither is set, then that is fine and we default.
        (Err(_), Err(_)) => {}
        _ => {
            error!(
                "Please specify both OPTIMIZELY_DATAFILE_URL_TEMPLATE and OPTIMIZELY_EVENTS_URL"
            );
        }
    }

    let client = Arc::new(Client::build(config_builder.build()).expect("failed to build client"));
    client.start_with_default_executor();

    if !client.initialized_async().await {
        error!("The client failed to initialize!");
    }

    let alice = client.create_user_context("alice", HashMap::new());
    alice.set_attribute("team", json!("Avengers"));
    let bob = client.create_user_context("bob", HashMap::new());

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        for user in [&alice, &bob] {
            let keys: Vec<&str> = flags.iter().map(String::as_str).collect();
            for (flag_key, decision) in user.decide_for_keys(&keys, &[DecideOption::IncludeReasons])
            {
                info!(
                    "user {}, flag {}: enabled={} variation={:?} reasons={:?}",
                    user.user_id(),
                    flag_key,
                    decision.enabled,
                    decision.variation_key,
                    decision.reasons
                );
            }
        }
    }
}
