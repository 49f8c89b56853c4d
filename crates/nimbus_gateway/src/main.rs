mod config;
mod runner;
mod telemetry;
mod udp_server;

use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use config::GatewayConfig;
use nimbus_cloud::{CloudRestClient, MqttLinkFactory, RegionalLocationProvider, UnwiredProvider};
use nimbus_domain::{
    CellLocationProvider, CellLocationResolver, CloudApi, DeviceRegistry, HistoryReplayService,
    MessageRouter, UiPublisher,
};
use nimbus_store::JsonFileStore;
use nimbus_ui::UiBroadcaster;
use runner::Runner;
use telemetry::TelemetryConfig;

#[tokio::main]
async fn main() {
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = telemetry::init_telemetry(&TelemetryConfig {
        log_level: config.log_level.clone(),
        json: config.log_json,
    }) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        udp_port = config.udp_port,
        http_port = config.http_port,
        device_count = config.device_count,
        "starting nimbus gateway"
    );

    let cloud: Arc<dyn CloudApi> = Arc::new(CloudRestClient::new(
        &config.api_endpoint,
        &config.api_key,
    ));

    // The account description gates everything else; without it no device
    // can connect.
    let account = match cloud.describe_account().await {
        Ok(account) => account,
        Err(e) => {
            error!(error = %e, "failed to describe cloud account");
            std::process::exit(1);
        }
    };
    info!(endpoint = %account.mqtt_endpoint, "cloud account resolved");

    let store = Arc::new(JsonFileStore::new(
        Path::new(&config.data_dir).join("devices.json"),
    ));
    let registry = DeviceRegistry::new(
        store,
        Arc::clone(&cloud),
        Arc::new(MqttLinkFactory::new()),
        account,
    );
    if let Err(e) = registry.bootstrap(config.device_count).await {
        error!(error = %e, "failed to bootstrap device registry");
        std::process::exit(1);
    }

    let mut providers: Vec<Arc<dyn CellLocationProvider>> = vec![Arc::new(
        RegionalLocationProvider::new(&config.cell_endpoint),
    )];
    if !config.unwired_api_key.is_empty() {
        providers.push(Arc::new(UnwiredProvider::new(
            &config.unwired_endpoint,
            &config.unwired_api_key,
        )));
    }
    let resolver = Arc::new(CellLocationResolver::new(providers));

    let broadcaster = UiBroadcaster::new();
    let ui: Arc<dyn UiPublisher> = broadcaster.clone();
    let router = MessageRouter::new(Arc::clone(&registry), resolver, ui);

    registry.connect_all().await;

    let history = HistoryReplayService::new(Arc::clone(&cloud), Arc::clone(&router), config.history_hours);

    let runner = Runner::new()
        .with_named_process("udp_server", {
            let router = Arc::clone(&router);
            let port = config.udp_port;
            move |token| udp_server::run(port, router, token)
        })
        .with_named_process("ui_server", {
            let broadcaster = Arc::clone(&broadcaster);
            let registry = Arc::clone(&registry);
            let cloud = Arc::clone(&cloud);
            let port = config.http_port;
            move |token| nimbus_ui::serve(broadcaster, registry, cloud, port, token)
        })
        .with_named_process("history_backfill", {
            let registry = Arc::clone(&registry);
            move |token| async move {
                let connections = registry.active_connections().await;
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = history.replay_all(connections) => {}
                }
                Ok(())
            }
        });

    if let Err(e) = runner.run().await {
        error!(error = %e, "gateway terminated");
        std::process::exit(1);
    }
}
