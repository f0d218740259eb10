use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tcptap::certificates::CertificateIssuer;
use tcptap::configuration::{CliArgs, Config};
use tcptap::data_capture::render::hex_dump;
use tcptap::data_capture::DataPacket;
use tcptap::error_handling::{ErrorCategory, ErrorReporter, LogReporter};
use tcptap::session_management::{ProxyService, ProxySession, RegistryEvent, SessionManager};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = CliArgs::parse();

    println!(
        "
==============================================================================
            tcptap v{} - intercepting TCP/TLS proxy
==============================================================================
",
        env!("CARGO_PKG_VERSION")
    );

    info!("Importing configuration");
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let session = match ProxySession::from_config(&config.session) {
        Ok(session) => session,
        Err(e) => {
            error!("Invalid session: {}", e);
            std::process::exit(1);
        }
    };

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter::with_fatal_channel(fatal_tx));

    let issuer = if session.tls_enabled() && config.proxy.intercept_client_tls {
        match CertificateIssuer::from_embedded() {
            Ok(issuer) => {
                debug!("Clients must trust the interception CA:\n{}", issuer.ca_certificate_pem());
                Some(Arc::new(issuer))
            }
            Err(e) => {
                reporter.report(&e, ErrorCategory::Initialization);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let manager = SessionManager::new(config.proxy.clone(), issuer, Arc::clone(&reporter));
    let service = ProxyService::new(manager, reporter);
    let printer = tokio::spawn(print_events(service.subscribe(), args.json));

    if let Err(e) = service.start_proxy_session(session) {
        error!("Unable to start proxy session: {}", e);
        std::process::exit(1);
    }

    let exit_code = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Unable to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, shutting down");
            0
        }
        Some(context) = fatal_rx.recv() => {
            error!("Fatal failure: {}", context.user_message());
            1
        }
    };

    service.stop_proxy_session().await;
    info!(
        "{} connections captured, {} still active",
        service.connections().len(),
        service.active_connection_count()
    );
    printer.abort();
    std::process::exit(exit_code);
}

async fn print_events(mut events: broadcast::Receiver<RegistryEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(RegistryEvent::PacketAdded(id, packet)) => print_packet(id, &packet, json),
            Ok(RegistryEvent::Registered(id)) => debug!("[{}] registered", id),
            Ok(RegistryEvent::Closed(id)) => debug!("[{}] closed", id),
            Ok(RegistryEvent::Cleared) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Display fell behind, {} events skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_packet(connection_id: Uuid, packet: &DataPacket, json: bool) {
    if json {
        let line = serde_json::json!({
            "connection_id": connection_id,
            "timestamp": packet.timestamp,
            "direction": packet.direction,
            "size": packet.size(),
            "data_type": packet.data_type,
            "display_text": packet.display_text,
        });
        println!("{}", line);
        return;
    }

    info!(
        "[{}] {} {} bytes ({:?})\n{}",
        connection_id,
        packet.direction.arrow(),
        packet.size(),
        packet.data_type,
        packet.display_text
    );
    debug!("[{}] hex dump:\n{}", connection_id, hex_dump(&packet.raw_data));
}
