use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::json_api::JsonObject;
use crate::server::ListenTarget;

/// Collaborative drawing session server
#[derive(Parser, Debug)]
#[command(name = "easel-server")]
#[command(about = "Collaborative drawing session server")]
#[command(version)]
pub struct ServerConfig {
    /// Address for drawing clients
    #[arg(long, default_value = "127.0.0.1:27750")]
    pub listen: SocketAddr,

    /// Listen on an inherited socket descriptor instead of binding
    #[arg(long)]
    pub fd: Option<i32>,

    /// Separate address for the admin API
    #[arg(long)]
    pub admin_listen: Option<SocketAddr>,

    /// Recording file pattern (%d, %t, %i, %a placeholders)
    #[arg(long)]
    pub recording: Option<String>,

    /// Stop once the last session closes
    #[arg(long)]
    pub auto_stop: bool,

    /// Ban list file, loaded at startup and rewritten on change
    #[arg(long)]
    pub banlist: Option<PathBuf>,

    /// Image data served to users joining a session. Without it the canvas
    /// is uploaded by a member of the session.
    #[arg(long)]
    pub canvas: Option<PathBuf>,

    /// Seconds without a pong before a client is dropped
    #[arg(long, default_value_t = 60)]
    pub client_timeout: u64,

    /// Seconds an unused session may stay open (0 = unlimited). Reported only
    #[arg(long, default_value_t = 0)]
    pub idle_time_limit: u64,

    /// Maximum session history size in bytes (0 = unlimited). Reported only
    #[arg(long, default_value_t = 0)]
    pub session_size_limit: u64,

    #[arg(long, default_value_t = 25)]
    pub session_count_limit: usize,

    /// Allow sessions to outlive their last user
    #[arg(long)]
    pub persistence: bool,

    #[arg(long, default_value = "")]
    pub title: String,

    #[arg(long, default_value = "")]
    pub welcome: String,

    /// Hide user names from the admin API
    #[arg(long)]
    pub private_user_list: bool,

    /// Reported only
    #[arg(long)]
    pub no_guests: bool,
}

impl ServerConfig {
    pub fn listen_target(&self) -> ListenTarget {
        match self.fd {
            #[cfg(unix)]
            Some(fd) => ListenTarget::Inherited(fd),
            #[cfg(not(unix))]
            Some(_) => {
                log::warn!("Inherited sockets are not supported here, binding {}", self.listen);
                ListenTarget::Address(self.listen)
            }
            None => ListenTarget::Address(self.listen),
        }
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            client_timeout: self.client_timeout,
            idle_time_limit: self.idle_time_limit,
            session_size_limit: self.session_size_limit,
            session_count_limit: self.session_count_limit,
            persistence: self.persistence,
            server_title: self.title.clone(),
            welcome_message: self.welcome.clone(),
            private_user_list: self.private_user_list,
            allow_guests: !self.no_guests,
        }
    }
}

/// Settings adjustable at runtime through the admin API.
///
/// Some keys are only stored and reported. They are kept so that front ends
/// and later layers (history, idle timers, authentication) read one settings
/// object. Changing them has no effect on this server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Seconds without a ping before a connection is dropped.
    pub client_timeout: u64,
    /// Stored only. Sessions here are never terminated for idling.
    pub idle_time_limit: u64,
    /// Stored only. The server keeps no history to measure.
    pub session_size_limit: u64,
    pub session_count_limit: usize,
    pub persistence: bool,
    /// Stored only.
    pub server_title: String,
    /// Stored only. Nothing is sent on join.
    pub welcome_message: String,
    pub private_user_list: bool,
    /// Stored only. Without accounts every user is a guest.
    pub allow_guests: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            client_timeout: 60,
            idle_time_limit: 0,
            session_size_limit: 0,
            session_count_limit: 25,
            persistence: false,
            server_title: String::new(),
            welcome_message: String::new(),
            private_user_list: false,
            allow_guests: true,
        }
    }
}

impl ServerSettings {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    /// Overlays the known keys of `patch`. Nothing changes if any value has the wrong type.
    pub fn update(&mut self, patch: &JsonObject) -> Result<(), serde_json::Error> {
        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(ref mut fields) = current {
            for (key, value) in patch {
                if fields.contains_key(key) {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}
