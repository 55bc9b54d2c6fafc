use std::io;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use tokio::sync::mpsc::unbounded_channel;

use easel_server::ban::BanList;
use easel_server::banlist_file::read_banlist_file;
use easel_server::config::ServerConfig;
use easel_server::handlers;
use easel_server::server::{spawn_server, Server, ServerCommand, ServerNotice, ServerOptions};
use easel_server::snapshot::{FixedSnapshot, MemberUpload, SnapshotProvider};

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let config = ServerConfig::parse();

    let bans = match &config.banlist {
        Some(path) => BanList::from_entries(read_banlist_file(path).await?),
        None => BanList::new(),
    };
    let snapshots: Arc<dyn SnapshotProvider> = match &config.canvas {
        Some(path) => Arc::new(FixedSnapshot(tokio::fs::read(path).await?)),
        None => Arc::new(MemberUpload),
    };

    let mut server = Server::new(
        ServerOptions {
            recording: config.recording.clone(),
            auto_stop: config.auto_stop,
        },
        config.settings(),
        Box::new(bans),
        snapshots,
    );
    let listener = server.start(config.listen_target()).map_err(|err| {
        log::error!("{}", err);
        io::Error::new(io::ErrorKind::Other, err)
    })?;

    let (notice_tx, mut notice_rx) = unbounded_channel();
    let srv_tx = spawn_server(server, config.banlist.clone(), notice_tx);

    let routes: fn(&mut web::ServiceConfig) = if config.admin_listen.is_some() {
        handlers::drawing
    } else {
        handlers::root
    };
    let drawing_srv_tx = srv_tx.clone();
    let drawing = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(drawing_srv_tx.clone()))
            .configure(routes)
    })
    .disable_signals()
    .listen(listener)?
    .run();
    let drawing_handle = drawing.handle();
    let drawing = actix_web::rt::spawn(drawing);

    let admin = match config.admin_listen {
        Some(addr) => {
            let admin_srv_tx = srv_tx.clone();
            log::info!("Admin API on {}", addr);
            let admin = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(admin_srv_tx.clone()))
                    .configure(handlers::admin)
            })
            .disable_signals()
            .bind(addr)?
            .run();
            let handle = admin.handle();
            Some((handle, actix_web::rt::spawn(admin)))
        }
        None => None,
    };

    let interrupt_tx = srv_tx.clone();
    actix_web::rt::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted");
            if interrupt_tx.send(ServerCommand::Stop).await.is_err() {
                log::warn!("Server loop is already gone");
            }
        }
    });

    while let Some(notice) = notice_rx.recv().await {
        match notice {
            ServerNotice::Status { users, sessions } => {
                log::debug!("{} users, {} sessions", users, sessions)
            }
            ServerNotice::StopAccepting => {
                // Closes the listening socket. Open connections get until the
                // shutdown timeout to be closed by their sessions.
                let drawing_handle = drawing_handle.clone();
                actix_web::rt::spawn(async move { drawing_handle.stop(true).await });
            }
            ServerNotice::Stopped => break,
        }
    }

    drawing_handle.stop(true).await;
    finish(drawing.await)?;
    if let Some((handle, admin)) = admin {
        handle.stop(true).await;
        finish(admin.await)?;
    }
    Ok(())
}

fn finish(joined: Result<io::Result<()>, actix_web::rt::task::JoinError>) -> io::Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) => {
            log::error!("HTTP server task failed: {}", err);
            Ok(())
        }
    }
}
