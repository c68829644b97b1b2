//! Guest lifecycle state machine.
//!
//! Every operation takes the caller's [`Guest`], drives the backend through a
//! pooled connection and hands the guest back with `state` (and, for some
//! operations, device names) filled in.
//!
//! | Operation       | Running        | Blocked/Shutdown/Shutoff/NoState | Paused/Suspended |
//! |-----------------|----------------|----------------------------------|------------------|
//! | Run             | nothing        | create                           | resume           |
//! | Shutdown        | shutdown       | shutdown (nothing if Shutdown/Shutoff) | shutdown   |
//! | Poweroff        | destroy        | destroy                          | destroy          |
//! | Reboot/Restart  | reboot         | reboot                           | reboot           |
//! | Status          | nothing        | nothing                          | nothing          |

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, instrument, warn, Span};

use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::traits::{not_found_as_none, Connection, DomainHandle};
use crate::types::{DomainState, Guest, Nic};
use crate::xml::{parse_domain, render_domain, render_network, RenderOptions};

/// Hypervisor flavor used when a guest does not name one.
pub const DEFAULT_GUEST_TYPE: &str = "kvm";

/// Settings the manager applies to every request.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub default_guest_type: String,
    pub render: RenderOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_guest_type: DEFAULT_GUEST_TYPE.to_string(),
            render: RenderOptions::default(),
        }
    }
}

/// Drives guest lifecycle operations against a pooled backend.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct GuestManager {
    pool: ConnectionPool,
    options: Arc<ManagerOptions>,
}

impl GuestManager {
    pub fn new(pool: ConnectionPool, options: ManagerOptions) -> Self {
        Self {
            pool,
            options: Arc::new(options),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Render, define and start a new domain.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn create(&self, mut guest: Guest) -> Result<Guest> {
        info!("Creating guest");

        guest.validate_id().map_err(|e| e.during("Create", &guest.id))?;
        guest.apply_default_type(&self.options.default_guest_type);

        let xml = render_domain(&guest, &self.options.render).map_err(|e| e.during("Create", &guest.id))?;
        debug!(xml_len = xml.len(), "Generated domain XML");

        let state = self
            .with_connection("Create", &guest.id, move |conn| {
                let domain = conn.define_domain(&xml)?;
                domain.create()?;
                domain.state()
            })
            .await?;

        info!(state = %state, "Guest created");
        guest.state = Some(state);
        Ok(guest)
    }

    /// Provision a guest: name its disks, give every NIC its own backend
    /// network, then define the domain without starting it.
    ///
    /// Not transactional. Networks defined before a failure stay defined.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn create_guest(&self, mut guest: Guest) -> Result<Guest> {
        info!(disks = guest.disks.len(), nics = guest.nics.len(), "Provisioning guest");

        guest.validate_id().map_err(|e| e.during("CreateGuest", &guest.id))?;
        guest.apply_default_type(&self.options.default_guest_type);
        guest.assign_disk_devices();
        for nic in &mut guest.nics {
            if nic.mac_address().is_none() {
                nic.mac = Some(generate_mac());
            }
        }

        let networks = guest
            .nics
            .iter()
            .map(render_network)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.during("CreateGuest", &guest.id))?;
        let xml = render_domain(&guest, &self.options.render)
            .map_err(|e| e.during("CreateGuest", &guest.id))?;

        let nics = guest.nics.clone();
        let state = self
            .with_connection("CreateGuest", &guest.id, move |conn| {
                for (nic, network_xml) in nics.iter().zip(&networks) {
                    let network = conn.define_network(network_xml)?;
                    network.set_autostart(true)?;
                    network.create()?;
                    info!(network = nic.mac_address().unwrap_or_default(), bridge = %nic.network, "Network started");
                }

                let domain = conn.define_domain(&xml)?;
                domain.state()
            })
            .await?;

        info!(state = %state, "Guest defined");
        guest.state = Some(state);
        Ok(guest)
    }

    /// Make sure the guest is running, then report its interface devices.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn run(&self, guest: Guest) -> Result<Guest> {
        info!("Running guest");

        self.with_domain("Run", guest, |domain, state, guest| {
            match state {
                DomainState::Running | DomainState::Crashed => {}
                DomainState::Paused | DomainState::Suspended => domain.resume()?,
                DomainState::Blocked
                | DomainState::Shutdown
                | DomainState::Shutoff
                | DomainState::NoState => domain.create()?,
            }

            let live = parse_domain(&domain.xml_desc()?)?;
            for (nic, iface) in guest.nics.iter_mut().zip(&live.devices.interfaces) {
                if let Some(dev) = iface.target_dev() {
                    nic.device = dev.to_string();
                }
                if let Some(alias) = iface.alias_name() {
                    nic.name = alias.to_string();
                }
            }
            Ok(())
        })
        .await
    }

    /// Ask the guest OS to shut down, unless it already is.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn shutdown(&self, guest: Guest) -> Result<Guest> {
        info!("Shutting down guest");

        self.with_domain("Shutdown", guest, |domain, state, _| match state {
            DomainState::Shutdown | DomainState::Shutoff => Ok(()),
            _ => domain.shutdown(),
        })
        .await
    }

    /// Force the guest off.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn poweroff(&self, guest: Guest) -> Result<Guest> {
        info!("Powering off guest");

        self.with_domain("Poweroff", guest, |domain, _, _| domain.destroy())
            .await
    }

    /// Soft-reboot the guest, whatever its state.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn reboot(&self, guest: Guest) -> Result<Guest> {
        info!("Rebooting guest");

        self.with_domain("Reboot", guest, |domain, _, _| domain.reboot())
            .await
    }

    /// Same as [`reboot`](Self::reboot).
    pub async fn restart(&self, guest: Guest) -> Result<Guest> {
        self.reboot(guest).await
    }

    /// Report the current state without touching the domain.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn status(&self, guest: Guest) -> Result<Guest> {
        debug!("Reading guest status");

        self.with_domain("Status", guest, |_, _, _| Ok(())).await
    }

    /// Destroy if active, undefine, then tear down each NIC's network.
    ///
    /// Networks the backend does not know are skipped. Not transactional.
    #[instrument(skip(self, guest), fields(guest = %guest.id))]
    pub async fn delete(&self, guest: Guest) -> Result<Guest> {
        info!("Deleting guest");

        guest.validate_id().map_err(|e| e.during("Delete", &guest.id))?;

        let id = guest.id.clone();
        let nics = guest.nics.clone();
        self.with_connection("Delete", &guest.id, move |conn| {
            {
                let domain = conn.lookup_domain(&id)?;
                if matches!(domain.state()?, DomainState::Running | DomainState::Paused) {
                    domain.destroy()?;
                }
                domain.undefine()?;
            }

            for nic in &nics {
                delete_network(conn, nic)?;
            }
            Ok(())
        })
        .await?;

        info!("Guest deleted");
        Ok(guest)
    }

    /// Acquire a connection, run `f` on it, and release the connection on
    /// every path. Errors from `f` carry the operation and guest.
    ///
    /// `f` and the release run on the blocking thread pool. A failure to
    /// close the connection is logged, never returned: the slot is back in
    /// the pool either way and the operation's result stands.
    pub(crate) async fn with_connection<T, F>(&self, operation: &'static str, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.acquire().await.map_err(|e| e.during(operation, id))?;

        let span = Span::current();
        let guest = id.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let outcome = f(&*conn);

            if let Err(e) = conn.release() {
                warn!(operation, guest = %guest, error = %e, "Failed to close backend connection");
            }
            outcome
        })
        .await
        .unwrap_or_else(|e| Err(e.into()));

        outcome.map_err(|e| e.during(operation, id))
    }

    /// The common wrapper: look the domain up, read its state, act, read the
    /// state again and report it on the guest.
    async fn with_domain<F>(&self, operation: &'static str, guest: Guest, action: F) -> Result<Guest>
    where
        F: FnOnce(&dyn DomainHandle, DomainState, &mut Guest) -> Result<()> + Send + 'static,
    {
        guest.validate_id().map_err(|e| e.during(operation, &guest.id))?;

        let id = guest.id.clone();
        let (state, mut guest) = self
            .with_connection(operation, &id, move |conn| {
                let mut guest = guest;
                let domain = conn.lookup_domain(&guest.id)?;
                let before = domain.state()?;
                action(domain.as_ref(), before, &mut guest)?;
                let after = domain.state()?;
                if before != after {
                    info!(operation, from = %before, to = %after, "Guest state changed");
                }
                Ok((after, guest))
            })
            .await?;

        guest.state = Some(state);
        Ok(guest)
    }
}

fn delete_network(conn: &dyn Connection, nic: &Nic) -> Result<()> {
    let Some(mac) = nic.mac_address() else {
        return Ok(());
    };

    let Some(network) = not_found_as_none(conn.lookup_network(mac))? else {
        debug!(network = mac, "No backend network for NIC");
        return Ok(());
    };

    if network.is_active()? {
        network.destroy()?;
    }
    network.undefine()?;
    info!(network = mac, "Network removed");
    Ok(())
}

/// Random locally administered MAC in the QEMU/KVM range.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}
