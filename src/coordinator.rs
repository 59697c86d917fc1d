//! The device session coordinator.
//!
//! A [`Coordinator`] is started into a task which owns everything mutable about one robot:
//! its [`DeviceState`], the live [`LinkSession`] and the [`RefreshScheduler`]. Everything
//! else talks to that task through one inbox:
//!
//! - [`CoordinatorHandle`]s post refresh requests, commands and the final stop,
//! - the transport's disconnect callback posts disconnects.
//!
//! The running link operation has an inbox of its own for the notification frames and the
//! optimistic state update it produces. That one is drained before the operation's outcome
//! is applied, so nothing the operation produced can land after its outcome.
//!
//! A link operation (refresh or command) runs as a future owned by the task. The session
//! is moved into that future for as long as it runs and handed back when it is done, so
//! two operations can never use the link at the same time.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::address::DeviceAddress;
use crate::config::{CommandTiming, CoordinatorConfig};
use crate::device_state::DeviceState;
use crate::error::{Error, Result};
use crate::link::{Connector, LinkSession};
use crate::message::{Command, Frame};
use crate::publisher::{ChannelRegistry, DeviceChannels, StatePublisher};
use crate::scheduler::{Backoff, Job, RefreshScheduler, Transition};
use crate::transport::{FrameSink, Transport, TransportError};

/// A command operation as the user sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    PowerOn,
    PowerOff,
    StartCleaning,
    StopCleaning,
}

impl Operation {
    fn command(self) -> Command {
        match self {
            Operation::PowerOn | Operation::StartCleaning => Command::PowerOn,
            Operation::PowerOff | Operation::StopCleaning => Command::PowerOff,
        }
    }

    /// The cleaning flag the robot should report once the command took effect
    fn expected_cleaning(self) -> bool {
        self.command() == Command::PowerOn
    }

    fn timing(self, config: &CoordinatorConfig) -> CommandTiming {
        match self.command() {
            Command::PowerOn => config.power_on,
            _ => config.power_off,
        }
    }
}

enum Event {
    RefreshRequested,
    Command {
        operation: Operation,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnected {
        session: u64,
    },
    Stop(oneshot::Sender<()>),
}

/// Produced by the running link operation
enum LinkEvent {
    Frame(Vec<u8>),
    /// Posted by a running command right before it writes
    Tentative(Operation),
}

struct PendingCommand {
    operation: Operation,
    reply: oneshot::Sender<Result<()>>,
}

struct JobOutcome<L> {
    session: Option<LinkSession<L>>,
    result: Result<()>,
}

impl<L> JobOutcome<L> {
    fn failed(error: Error) -> Self {
        Self {
            session: None,
            result: Err(error),
        }
    }
}

struct InFlight<L> {
    job: Job<PendingCommand>,
    task: BoxFuture<'static, JobOutcome<L>>,
}

/// Keeps one robot's state up to date. Construct it, then [`start`](Coordinator::start) it.
pub struct Coordinator<T: Transport> {
    address: DeviceAddress,
    config: CoordinatorConfig,
    connector: Connector<T>,
    channels: Arc<DeviceChannels>,
}

impl<T: Transport> Coordinator<T> {
    /// Fails on a malformed address or configuration. Those are the only errors that are
    /// never retried.
    pub fn new(
        address: &str,
        transport: Arc<T>,
        registry: &ChannelRegistry,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let address = DeviceAddress::parse(address)?;
        config.validate()?;
        let connector = Connector::new(transport, address.clone(), config.connect_timeout());
        let channels = registry.channels(&address);
        Ok(Self {
            address,
            config,
            connector,
            channels,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Spawn the coordinator onto the current tokio runtime.
    ///
    /// Returns immediately, the first refresh runs in the background. The periodic
    /// refresh and the on-demand refresh listener are active from here until
    /// [`CoordinatorHandle::stop`].
    pub fn start(self) -> CoordinatorHandle {
        let (inbox, events) = mpsc::unbounded_channel();
        let (link_events, link_inbox) = mpsc::unbounded_channel();
        let refresh_requests = self.channels.refresh_requests();
        let scheduler = RefreshScheduler::new(Backoff::new(
            self.config.backoff_start(),
            self.config.backoff_max(),
        ));

        let actor = Actor {
            address: self.address.clone(),
            publisher: StatePublisher::new(self.address.clone(), self.channels.clone()),
            config: self.config,
            connector: self.connector,
            inbox: inbox.downgrade(),
            link_events,
            state: DeviceState::UNAVAILABLE,
            session: None,
            lost_session: None,
            scheduler,
            in_flight: None,
        };
        info!(address = %self.address, "starting coordinator");
        tokio::spawn(actor.run(events, link_inbox, refresh_requests));

        CoordinatorHandle {
            address: self.address,
            inbox,
            channels: self.channels,
        }
    }
}

/// Cheap to clone. Once every handle is dropped the coordinator stops as if
/// [`stop`](CoordinatorHandle::stop) had been called.
#[derive(Clone)]
pub struct CoordinatorHandle {
    address: DeviceAddress,
    inbox: mpsc::UnboundedSender<Event>,
    channels: Arc<DeviceChannels>,
}

impl CoordinatorHandle {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// The device's broadcast channels
    pub fn channels(&self) -> &DeviceChannels {
        &self.channels
    }

    /// The latest published state
    pub fn state(&self) -> DeviceState {
        self.channels.current()
    }

    /// Ask for a refresh. Coalesces with one that is already running.
    pub fn request_refresh(&self) {
        let _ = self.inbox.send(Event::RefreshRequested);
    }

    pub async fn power_on(&self) -> Result<()> {
        self.run(Operation::PowerOn).await
    }

    pub async fn power_off(&self) -> Result<()> {
        self.run(Operation::PowerOff).await
    }

    pub async fn start_cleaning(&self) -> Result<()> {
        self.run(Operation::StartCleaning).await
    }

    pub async fn stop_cleaning(&self) -> Result<()> {
        self.run(Operation::StopCleaning).await
    }

    /// Stop timers, disconnect and publish the robot as unavailable one last time.
    /// Does nothing when already stopped.
    pub async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.inbox.send(Event::Stop(done)).is_ok() {
            let _ = stopped.await;
        }
    }

    async fn run(&self, operation: Operation) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.inbox
            .send(Event::Command { operation, reply })
            .map_err(|_| Error::Stopped)?;
        outcome.await.map_err(|_| Error::Stopped)?
    }
}

struct Actor<T: Transport> {
    address: DeviceAddress,
    config: CoordinatorConfig,
    connector: Connector<T>,
    inbox: mpsc::WeakUnboundedSender<Event>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    state: DeviceState,
    publisher: StatePublisher,
    session: Option<LinkSession<T::Link>>,
    /// Most recent session the transport reported as dropped
    lost_session: Option<u64>,
    scheduler: RefreshScheduler<PendingCommand>,
    in_flight: Option<InFlight<T::Link>>,
}

impl<T: Transport> Actor<T> {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut link_inbox: mpsc::UnboundedReceiver<LinkEvent>,
        refresh_requests: broadcast::Receiver<()>,
    ) {
        let period = self.config.refresh_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_requests = Some(refresh_requests);

        self.request_refresh("startup");

        loop {
            let retry_at = self.scheduler.deadline();
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!(address = %self.address, "all handles dropped");
                        self.shutdown().await;
                        return;
                    };
                    if self.handle(event).await.is_break() {
                        return;
                    }
                }
                Some(event) = link_inbox.recv() => self.handle_link_event(event),
                outcome = drive(&mut self.in_flight) => {
                    // Everything the operation posted is queued by now
                    while let Ok(event) = link_inbox.try_recv() {
                        self.handle_link_event(event);
                    }
                    self.finish(outcome);
                }
                _ = ticker.tick() => self.request_refresh("periodic"),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    if self.scheduler.backoff_elapsed() {
                        debug!(address = %self.address, "retrying");
                        self.start(Job::Refresh);
                    }
                }
                request = next_refresh_request(&mut refresh_requests) => match request {
                    Ok(()) | Err(RecvError::Lagged(_)) => self.request_refresh("on demand"),
                    Err(RecvError::Closed) => refresh_requests = None,
                },
            }
        }
    }

    async fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::RefreshRequested => self.request_refresh("requested"),
            Event::Command { operation, reply } => {
                match self.scheduler.submit(PendingCommand { operation, reply }) {
                    Some(pending) => self.start(Job::Command(pending)),
                    None => debug!(address = %self.address, ?operation, "link busy, command queued"),
                }
            }
            Event::Disconnected { session } => self.handle_disconnect(session),
            Event::Stop(done) => {
                self.shutdown().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => self.handle_frame(&frame),
            LinkEvent::Tentative(operation) => {
                debug!(address = %self.address, ?operation, "optimistic update");
                self.state.assume_cleaning(operation.expected_cleaning());
                self.publisher.publish(&self.state);
            }
        }
    }

    fn request_refresh(&mut self, reason: &'static str) {
        if self.scheduler.request_refresh() {
            debug!(address = %self.address, reason, "refresh");
            self.start(Job::Refresh);
        } else {
            debug!(address = %self.address, reason, phase = ?self.scheduler.phase(), "link busy, queued trailing refresh");
        }
    }

    /// Every frame goes through here, whichever operation is waiting for it
    fn handle_frame(&mut self, frame: &[u8]) {
        let rx = hex::encode(frame);
        match Frame::classify(frame, self.config.in_water_bytes()) {
            Frame::Ack => debug!(address = %self.address, rx = %rx, "ack ignored"),
            Frame::Status(status) => {
                debug!(
                    address = %self.address,
                    rx = %rx,
                    cleaning = status.cleaning,
                    minutes = status.minutes_remaining,
                    in_water = status.in_water,
                    "status"
                );
                self.state.apply_status(&status);
                self.publisher.publish(&self.state);
            }
            Frame::Unknown => debug!(address = %self.address, rx = %rx, "unexpected frame"),
        }
    }

    fn handle_disconnect(&mut self, session: u64) {
        if session != self.connector.latest_id() {
            debug!(address = %self.address, session, "disconnect of a replaced session ignored");
            return;
        }
        info!(address = %self.address, session, "disconnected");
        self.lost_session = Some(session);
        if self.session.as_ref().is_some_and(|s| s.id() == session) {
            self.session = None;
        }
        self.state.mark_unavailable();
        self.publisher.publish(&self.state);
    }

    fn start(&mut self, job: Job<PendingCommand>) {
        let exchange = Exchange {
            connector: self.connector.clone(),
            inbox: self.inbox.clone(),
            link_events: self.link_events.clone(),
            exchange_timeout: self.config.exchange_timeout(),
        };
        let session = self.session.take();
        let task = match &job {
            Job::Refresh => exchange.refresh(session, self.config.notify_wait()).boxed(),
            Job::Command(pending) => {
                let operation = pending.operation;
                debug!(address = %self.address, ?operation, "command");
                exchange
                    .command(session, operation, operation.timing(&self.config))
                    .boxed()
            }
        };
        self.in_flight = Some(InFlight { job, task });
    }

    fn finish(&mut self, outcome: JobOutcome<T::Link>) {
        let Some(InFlight { job, .. }) = self.in_flight.take() else {
            return;
        };

        self.session = outcome
            .session
            .filter(|s| Some(s.id()) != self.lost_session);
        let success = outcome.result.is_ok();
        match &outcome.result {
            Ok(()) => {
                if matches!(job, Job::Refresh) && self.session.is_some() {
                    self.state.available = true;
                    self.publisher.publish(&self.state);
                }
            }
            Err(error) => {
                debug!(address = %self.address, %error, "link operation failed");
                self.state.mark_unavailable();
                self.publisher.publish(&self.state);
            }
        }
        if let Job::Command(pending) = job {
            let _ = pending.reply.send(outcome.result);
        }

        match self.scheduler.finish(success, Instant::now()) {
            Transition::Idle => {}
            Transition::Backoff(delay) => {
                debug!(address = %self.address, retry_in = ?delay, "scheduling retry");
            }
            Transition::Run(job) => self.start(job),
        }
    }

    async fn shutdown(&mut self) {
        info!(address = %self.address, "stopping coordinator");
        for pending in self.scheduler.cancel() {
            let _ = pending.reply.send(Err(Error::Stopped));
        }
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
        if let Some(InFlight { job, task }) = self.in_flight.take() {
            if let Job::Command(pending) = job {
                let _ = pending.reply.send(Err(Error::Stopped));
            }
            // Not aborted mid-write, but nothing it produces is used any more
            let limit = self.config.refresh_timeout();
            let address = self.address.clone();
            tokio::spawn(async move {
                match timeout(limit, task).await {
                    Ok(JobOutcome {
                        session: Some(session),
                        ..
                    }) => session.disconnect().await,
                    Ok(_) => {}
                    Err(_) => warn!(%address, "abandoned link operation did not finish"),
                }
            });
        }
        self.state.reset();
        self.publisher.publish(&self.state);
        self.publisher.close();
    }
}

async fn drive<L>(in_flight: &mut Option<InFlight<L>>) -> JobOutcome<L> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.task).await,
        None => std::future::pending().await,
    }
}

async fn next_refresh_request(
    requests: &mut Option<broadcast::Receiver<()>>,
) -> std::result::Result<(), RecvError> {
    match requests {
        Some(requests) => requests.recv().await,
        None => std::future::pending().await,
    }
}

/// The body of one link operation, run outside the coordinator's state
struct Exchange<T> {
    connector: Connector<T>,
    inbox: mpsc::WeakUnboundedSender<Event>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    exchange_timeout: Duration,
}

impl<T: Transport> Exchange<T> {
    fn post(&self, event: LinkEvent) {
        let _ = self.link_events.send(event);
    }

    fn frame_sink(&self) -> FrameSink {
        let link_events = self.link_events.clone();
        Arc::new(move |frame| {
            let _ = link_events.send(LinkEvent::Frame(frame));
        })
    }

    async fn connect(&self, current: Option<LinkSession<T::Link>>) -> Result<LinkSession<T::Link>> {
        let inbox = self.inbox.clone();
        self.connector
            .ensure_connected(current, move |session| {
                if let Some(inbox) = inbox.upgrade() {
                    let _ = inbox.send(Event::Disconnected { session });
                }
            })
            .await
    }

    /// Query the status and give the notification time to arrive
    async fn refresh(
        self,
        current: Option<LinkSession<T::Link>>,
        notify_wait: Duration,
    ) -> JobOutcome<T::Link> {
        let mut session = match self.connect(current).await {
            Ok(session) => session,
            Err(error) => return JobOutcome::failed(error),
        };
        let sink = self.frame_sink();
        let result = timeout(self.exchange_timeout, async {
            session.start_notifications(sink).await?;
            session.write_command(Command::QueryStatus).await?;
            sleep(notify_wait).await;
            session.stop_notifications().await
        })
        .await;
        self.conclude(session, result).await
    }

    /// Write a command, then query the status so the robot confirms or corrects the
    /// optimistic update
    async fn command(
        self,
        current: Option<LinkSession<T::Link>>,
        operation: Operation,
        timing: CommandTiming,
    ) -> JobOutcome<T::Link> {
        let mut session = match self.connect(current).await {
            Ok(session) => session,
            Err(error) => return JobOutcome::failed(error),
        };
        let sink = self.frame_sink();
        let result = timeout(self.exchange_timeout, async {
            session.start_notifications(sink).await?;
            self.post(LinkEvent::Tentative(operation));
            session.write_command(operation.command()).await?;
            sleep(timing.settle()).await;
            session.write_command(Command::QueryStatus).await?;
            sleep(timing.status_wait()).await;
            session.stop_notifications().await
        })
        .await;
        self.conclude(session, result).await
    }

    /// A failed exchange never leaves a half-working session behind
    async fn conclude(
        &self,
        session: LinkSession<T::Link>,
        result: std::result::Result<std::result::Result<(), TransportError>, tokio::time::error::Elapsed>,
    ) -> JobOutcome<T::Link> {
        let error = match result {
            Ok(Ok(())) => {
                return JobOutcome {
                    session: Some(session),
                    result: Ok(()),
                }
            }
            Ok(Err(e)) => Error::Transport(e),
            Err(_) => Error::Timeout(self.exchange_timeout),
        };
        debug!(session = session.id(), %error, "exchange failed, tearing the session down");
        session.disconnect().await;
        JobOutcome::failed(error)
    }
}
