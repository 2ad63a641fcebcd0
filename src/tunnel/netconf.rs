//! OS network configuration

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::run_command;
use crate::error::Result;

/// Assigns the mesh address to the tunnel interface and routes the range
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    async fn assign(&self, interface: &str, address: Ipv4Net, mesh: Ipv4Net) -> Result<()>;
}

/// Linux `ip` based configurator
#[derive(Debug, Default)]
pub struct IpRouteConfigurator;

impl IpRouteConfigurator {
    /// The `ip` invocations for one assignment, in order
    pub fn commands(interface: &str, address: Ipv4Net, mesh: Ipv4Net) -> Vec<Vec<String>> {
        let addr = address.to_string();
        let mesh = mesh.trunc().to_string();
        vec![
            vec!["address".into(), "replace".into(), addr, "dev".into(), interface.into()],
            vec!["link".into(), "set".into(), "up".into(), "dev".into(), interface.into()],
            vec!["route".into(), "replace".into(), mesh, "dev".into(), interface.into()],
        ]
    }
}

#[async_trait]
impl NetworkConfigurator for IpRouteConfigurator {
    async fn assign(&self, interface: &str, address: Ipv4Net, mesh: Ipv4Net) -> Result<()> {
        for args in Self::commands(interface, address, mesh) {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run_command("ip", &args, None).await?;
        }
        tracing::info!("Assigned {} to {}, routing {}", address, interface, mesh.trunc());
        Ok(())
    }
}
