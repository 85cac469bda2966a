use std::{sync::Arc, time::Duration};

use attribution_core::{ClientConfig, Event, FileStore, InitOptions, NoInstallReferrer};

pub fn main() {
    env_logger::init();

    let app_key = std::env::var("ATTRIBUTION_APP_KEY").unwrap();
    let store = FileStore::open(std::env::temp_dir().join("attribution-demo.json")).unwrap();
    let client = ClientConfig::from_app_key(app_key)
        .store(Arc::new(store))
        .referrer_provider(Arc::new(NoInstallReferrer))
        .to_client()
        .unwrap();

    // Start a session. Events logged before it is established wait in the queue.
    client.init_session(InitOptions::new().callback(|params| {
        println!("Session started: {:?}", params);
    }));
    client.log_event(Event::custom("demo_opened"), |outcome| {
        println!("Event sent: {:?}", outcome);
    });

    // Block until the session request completes or give up after a few seconds.
    let params = client.latest_referring_params_sync(Duration::from_secs(10));
    println!("Referring params: {}", params);

    std::thread::sleep(Duration::from_secs(2));
    client.shutdown();
}
