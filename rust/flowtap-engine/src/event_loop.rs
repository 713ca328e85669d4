//! Socket event loop: server-side half of every flow
//!
//! Waits on the real sockets registered by the dispatcher, completes
//! connects, and turns whatever remote peers send into packets for the
//! tunnel.

use crate::channel::{finish_connect, Channel, ConnectProgress};
use crate::context::EngineContext;
use crate::dns;
use crate::error::{EngineError, Result};
use crate::flow::{Flow, FlowStatus, Protocol};
use crate::selector::WAKE_TOKEN;
use mio::event::Event;
use mio::{Events, Interest, Poll};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

const EVENTS_CAPACITY: usize = 1024;
/// Upper bound on how long idle datagram flows may outlive their timeout
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct EventLoop {
    poll: Poll,
    events: Events,
    ctx: Arc<EngineContext>,
    running: Arc<AtomicBool>,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl EventLoop {
    pub fn new(poll: Poll, ctx: Arc<EngineContext>, running: Arc<AtomicBool>) -> Self {
        let sweep_interval = ctx.config.udp_idle_timeout().min(MAX_SWEEP_INTERVAL);
        Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ctx,
            running,
            sweep_interval,
            last_sweep: Instant::now(),
        }
    }

    pub fn run(mut self) -> Result<()> {
        info!("Event loop started");
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.turn(Some(self.sweep_interval)) {
                error!("Event loop failed: {}", e);
                return Err(e);
            }
        }
        info!("Event loop stopped");
        Ok(())
    }

    /// One selection pass; returns the number of socket events handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        // Let a registration in progress finish before parking in poll
        self.ctx.selector.barrier();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(EngineError::Multiplexer(format!("poll failed: {}", e))),
        }

        let mut handled = 0;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            handled += 1;
            self.handle(event);
        }

        if self.last_sweep.elapsed() >= self.sweep_interval {
            self.sweep_idle();
            self.last_sweep = Instant::now();
        }
        Ok(handled)
    }

    /// Drop datagram flows that have been silent past the idle timeout.
    fn sweep_idle(&self) {
        let timeout = self.ctx.config.udp_idle_timeout();
        for flow in self.ctx.registry.idle_datagram_flows(timeout) {
            trace!("[{}] {} idle, closing", flow.id(), flow.key());
            self.ctx.discard(&flow);
            self.ctx.stats.record_udp_expired();
        }
    }

    fn handle(&self, event: &Event) {
        let token = event.token();
        let Some(flow) = self.ctx.selector.flow_for(token) else {
            trace!("Event for {:?} whose flow is gone", token);
            return;
        };

        let channel = flow.channel().as_ref().map(Channel::protocol);
        match channel {
            None => {
                error!("[{}] {} registered without a channel, cancelling", flow.id(), flow.key());
                self.ctx.selector.lock().deregister(&flow);
                return;
            }
            Some(protocol) if protocol != flow.protocol() => {
                error!(
                    "[{}] {} registered with a {} channel, cancelling",
                    flow.id(),
                    flow.key(),
                    protocol
                );
                self.ctx.selector.lock().close(&flow);
                return;
            }
            Some(_) => {}
        }

        match flow.protocol() {
            Protocol::Tcp => {
                let connected = flow.tcp().map(|tcp| tcp.state().syn_ack_sent()).unwrap_or(false);
                if connected {
                    self.on_tcp_readable(&flow);
                } else {
                    self.on_connect(&flow);
                }
            }
            Protocol::Udp => self.on_udp_readable(&flow),
        }
    }

    fn on_connect(&self, flow: &Arc<Flow>) {
        if flow.status() != FlowStatus::Connecting {
            trace!("[{}] {} connect event while {}", flow.id(), flow.key(), flow.status());
            return;
        }

        let progress = match flow.channel().as_ref() {
            Some(Channel::Tcp(stream)) => finish_connect(stream),
            _ => Err(EngineError::NoChannel),
        };

        match progress {
            Ok(ConnectProgress::Pending) => trace!("[{}] {} connect still pending", flow.id(), flow.key()),
            Ok(ConnectProgress::Connected) => {
                if let Err(e) = self.ctx.selector.lock().reregister(flow, Interest::READABLE) {
                    self.ctx.abort(flow, &format!("reregister failed: {}", e));
                    return;
                }
                let Some(tcp) = flow.tcp() else {
                    return;
                };
                debug!("[{}] {} connected to {}", flow.id(), flow.key(), flow.remote());
                self.ctx.send_to_client(flow, tcp.build_syn_ack(), 0);
            }
            Err(e) => self.ctx.abort(flow, &format!("connect failed: {}", e)),
        }
    }

    fn on_tcp_readable(&self, flow: &Arc<Flow>) {
        let Some(tcp) = flow.tcp() else {
            return;
        };
        let mut eof = false;
        let mut failure = None;
        {
            let mut buf = flow.in_buffer();
            loop {
                let read = match flow.channel().as_mut() {
                    Some(Channel::Tcp(stream)) => stream.read(&mut buf[..]),
                    // Closed by the dispatcher in the meantime
                    _ => break,
                };
                match read {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        let packet = tcp.build_data_ack(&buf[..n]);
                        self.ctx.send_to_client(flow, packet, n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            self.ctx.abort(flow, &format!("read failed: {}", e));
        } else if eof {
            self.on_remote_eof(flow);
        }
    }

    /// The remote side finished sending: half-close towards the client.
    fn on_remote_eof(&self, flow: &Arc<Flow>) {
        let Some(tcp) = flow.tcp() else {
            return;
        };
        let status = {
            let mut selector = self.ctx.selector.lock();
            // The channel stays open: the client may still be sending
            selector.deregister(flow);
            let status = flow.status();
            // Connecting here means the SYN-ACK is out and only the client's ACK is missing
            if matches!(status, FlowStatus::Connecting | FlowStatus::Connected) {
                if let Err(e) = flow.transition(FlowStatus::Closing) {
                    drop(selector);
                    self.ctx.abort(flow, &e.to_string());
                    return;
                }
            }
            status
        };

        match status {
            FlowStatus::Connecting | FlowStatus::Connected => {
                debug!("[{}] {} remote closed, half-closing", flow.id(), flow.key());
                self.ctx.send_to_client(flow, tcp.build_fin_ack(), 0);
            }
            FlowStatus::Closing if !tcp.state().engine_fin_sent() => {
                self.ctx.send_to_client(flow, tcp.build_fin_ack(), 0);
            }
            other => trace!("[{}] {} remote EOF while {}", flow.id(), flow.key(), other),
        }
    }

    fn on_udp_readable(&self, flow: &Arc<Flow>) {
        let Some(udp) = flow.udp() else {
            return;
        };
        let dns = flow.is_dns();
        let mut answered = false;
        let mut failure = None;
        {
            let mut buf = flow.in_buffer();
            loop {
                let read = match flow.channel().as_ref() {
                    Some(Channel::Udp(socket)) => socket.recv(&mut buf[..]),
                    _ => break,
                };
                match read {
                    Ok(n) => {
                        udp.state().touch();
                        let payload = &buf[..n];
                        if dns {
                            self.learn_hostnames(payload);
                        }
                        self.ctx.send_to_client(flow, udp.build_datagram(payload), n);
                        answered = true;
                        if dns {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if dns && answered {
            trace!("[{}] {} answered, closing", flow.id(), flow.key());
            if self.ctx.close(flow).is_err() {
                self.ctx.discard(flow);
            }
        } else if let Some(e) = failure {
            debug!("[{}] {} channel failed: {}", flow.id(), flow.key(), e);
            self.ctx.discard(flow);
        }
    }

    fn learn_hostnames(&self, payload: &[u8]) {
        match dns::parse_response(payload) {
            Ok(answers) => {
                self.ctx.stats.record_dns_response();
                for (addr, hostname) in answers {
                    self.ctx.hostnames.insert(addr, hostname);
                }
            }
            Err(e) => debug!("Ignoring DNS response: {}", e),
        }
    }
}
