//! # NAT Port Mapping
//!
//! The core does not speak UPnP or NAT-PMP itself. The embedder supplies a
//! [`Mapper`]; the core reads the external IP once to fix up its advertised
//! endpoint and keeps the port mapping alive from a background task.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifetime requested for each mapping.
pub const MAP_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// How often the mapping is refreshed. Comfortably inside the lifetime so
/// a lost refresh does not drop the port.
pub const MAP_REFRESH: Duration = Duration::from_secs(15 * 60);

/// Transport protocol of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        })
    }
}

/// A NAT port-mapping device (UPnP, NAT-PMP, or anything else the embedder
/// wires up).
#[async_trait]
pub trait Mapper: Send + Sync + 'static {
    /// The router's external address, if it can be determined.
    async fn external_ip(&self) -> Option<IpAddr>;

    /// Maps `ext_port` on the device to `int_port` locally for `lifetime`.
    async fn add_mapping(
        &self,
        proto: Protocol,
        int_port: u16,
        ext_port: u16,
        lifetime: Duration,
        name: &str,
    ) -> anyhow::Result<()>;
}

/// Keeps a port mapping alive until `quit` fires. Mapping failures are
/// logged and retried on the next refresh.
pub async fn map_loop(
    mapper: std::sync::Arc<dyn Mapper>,
    mut quit: watch::Receiver<bool>,
    proto: Protocol,
    int_port: u16,
    ext_port: u16,
    name: &str,
) {
    loop {
        match mapper
            .add_mapping(proto, int_port, ext_port, MAP_LIFETIME, name)
            .await
        {
            Ok(()) => debug!(%proto, int_port, ext_port, name, "port mapping refreshed"),
            Err(err) => warn!(%proto, int_port, error = %err, "port mapping failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(MAP_REFRESH) => {}
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingMapper {
        mappings: AtomicUsize,
    }

    #[async_trait]
    impl Mapper for CountingMapper {
        async fn external_ip(&self) -> Option<IpAddr> {
            Some(IpAddr::from([203, 0, 113, 7]))
        }

        async fn add_mapping(
            &self,
            _proto: Protocol,
            _int_port: u16,
            _ext_port: u16,
            _lifetime: Duration,
            _name: &str,
        ) -> anyhow::Result<()> {
            self.mappings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn map_loop_maps_once_and_stops_on_quit() {
        let mapper = Arc::new(CountingMapper {
            mappings: AtomicUsize::new(0),
        });
        let (quit_tx, quit_rx) = watch::channel(false);

        let handle = tokio::spawn(map_loop(
            mapper.clone() as Arc<dyn Mapper>,
            quit_rx,
            Protocol::Udp,
            30303,
            30303,
            "test",
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mapper.mappings.load(Ordering::SeqCst), 1);

        quit_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits on quit")
            .unwrap();
    }
}
