//! Bridge lifecycle and event-loop integration.
//!
//! [`Netif`] owns every descriptor of the bridge and exposes the two entry
//! points the host's `select`-style loop needs: [`Netif::update_fd_set`] to
//! register readables before blocking, and [`Netif::process`] to dispatch
//! readiness afterwards. Within one `process` tick the handlers run in a
//! fixed order: buffered stack events, then the tunnel, then kernel events,
//! then MLD reports.

use std::os::fd::RawFd;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fdset::FdSet;
#[cfg(target_os = "linux")]
use crate::monitor::MldMonitor;
use crate::monitor::KernelEventSource;
use crate::netcfg::{KernelConfig, KernelNetConfig};
use crate::reconciler::Reconciler;
use crate::shuttle::PacketShuttle;
use crate::stack::{Ip6Stack, StackEvent, StackEventSender, event_channel};
use crate::tun::TunDevice;

/// Init parameters.
#[derive(Debug, Clone, Default)]
pub struct NetifConfig {
    /// Interface name hint; the platform driver may substitute its own.
    pub interface_name: Option<String>,
}

/// The interface bridge. Fields are declared in reverse construction order
/// so teardown releases descriptors in reverse of acquisition.
pub struct Netif<S: Ip6Stack> {
    #[cfg(target_os = "linux")]
    mld: MldMonitor,
    events: KernelEventSource,
    reconciler: Reconciler<S, KernelNetConfig>,
    shuttle: PacketShuttle,
    stack_events: crossbeam_channel::Receiver<StackEvent>,
}

impl<S: Ip6Stack> Netif<S> {
    /// Open the tunnel and every monitoring descriptor, and wire up the
    /// stack handle.
    ///
    /// The returned [`StackEventSender`] must be connected to the stack's
    /// receive, address-change, and state-change callbacks; the bridge
    /// drains it on every `process` tick.
    pub fn new(mut stack: S, config: NetifConfig) -> Result<(Self, StackEventSender)> {
        let tun = TunDevice::open(config.interface_name.as_deref())?;
        let kernel = KernelNetConfig::new(tun.name(), tun.index())?;
        let events = KernelEventSource::open(tun.name(), tun.index())?;
        #[cfg(target_os = "linux")]
        let mld = MldMonitor::open(tun.name(), tun.index())?;

        // the kernel interface answers echo requests from here on
        stack.set_icmp_echo_enabled(false);

        // no multicast membership events reach us at all on this platform,
        // so ask the stack to pass every group up and let the kernel filter
        #[cfg(target_os = "netbsd")]
        stack.set_multicast_promiscuous(true);

        info!(name = %tun.name(), index = tun.index(), "interface bridge initialized");

        let (sender, receiver) = event_channel();
        let netif = Self {
            #[cfg(target_os = "linux")]
            mld,
            events,
            reconciler: Reconciler::new(stack, kernel),
            shuttle: PacketShuttle::new(tun),
            stack_events: receiver,
        };
        Ok((netif, sender))
    }

    /// Published interface identity: `(name, kernel index)`.
    pub fn interface(&self) -> (&str, u32) {
        (self.shuttle.tun().name(), self.shuttle.tun().index())
    }

    #[cfg(target_os = "linux")]
    fn core_fds(&self) -> [RawFd; 3] {
        [
            self.shuttle.as_raw_fd(),
            self.events.as_raw_fd(),
            self.mld.as_raw_fd(),
        ]
    }

    #[cfg(not(target_os = "linux"))]
    fn core_fds(&self) -> [RawFd; 2] {
        [self.shuttle.as_raw_fd(), self.events.as_raw_fd()]
    }

    /// Register the bridge's descriptors in the read and error sets and
    /// raise the loop's highest descriptor. The bridge never needs the
    /// write set; writes are synchronous.
    pub fn update_fd_set(&self, read_set: &mut FdSet, error_set: &mut FdSet, max_fd: &mut RawFd) {
        for fd in self.core_fds() {
            read_set.insert(fd);
            error_set.insert(fd);
            if fd > *max_fd {
                *max_fd = fd;
            }
        }
    }

    /// Dispatch one readiness report from the host loop.
    ///
    /// An error condition on any core descriptor is fatal: the caller must
    /// tear the bridge down and terminate with [`Error::exit_code`].
    pub fn process(&mut self, read_set: &FdSet, error_set: &FdSet) -> Result<()> {
        for fd in self.core_fds() {
            if error_set.contains(fd) {
                return Err(Error::Fatal("error condition on a core descriptor"));
            }
        }

        self.drain_stack_events();

        if read_set.contains(self.shuttle.as_raw_fd())
            && let Some(datagram) = self.shuttle.recv()?
        {
            self.reconciler.deliver_inbound(datagram);
        }

        if read_set.contains(self.events.as_raw_fd()) {
            for event in self.events.poll_events()? {
                self.reconciler.handle_kernel_event(event);
            }
        }

        #[cfg(target_os = "linux")]
        if read_set.contains(self.mld.as_raw_fd()) {
            for event in self.mld.poll_events()? {
                self.reconciler.handle_kernel_event(event);
            }
        }

        Ok(())
    }

    fn drain_stack_events(&mut self) {
        while let Ok(event) = self.stack_events.try_recv() {
            match event {
                StackEvent::Received(datagram) => self.shuttle.send(&datagram),
                StackEvent::AddressChanged {
                    addr,
                    prefix_len,
                    added,
                } => self.reconciler.handle_address_change(addr, prefix_len, added),
                StackEvent::StateChanged { flags } => self.reconciler.handle_state_change(flags),
            }
        }
    }
}

impl<S: Ip6Stack> Drop for Netif<S> {
    fn drop(&mut self) {
        if let Err(err) = self.reconciler.kernel_mut().destroy_tunnel() {
            warn!(error = %err, "failed to destroy tunnel interface");
        }
    }
}
