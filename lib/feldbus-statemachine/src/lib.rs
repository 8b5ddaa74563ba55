#![no_std]

//! Cooperative state machine engine ("IM"): a fixed set of states cycles
//! through a `state_function` (do the work, report success) and a
//! `transition_function` (decide what runs next) under a tick-driven
//! scheduler, rather than an executor thread per state machine.

use heapless::Vec as HVec;

/// Opaque handle identifying one of a state machine's registered states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateId(usize);

/// What a state's `transition_function` decides should happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Remain in the current state; no `state_function` call this tick.
    Stay,
    /// Enter a different state, running its `state_function`.
    To(StateId),
    /// Call the current state's `state_function` again without leaving it.
    Redo,
    /// The state machine is done; shut down gracefully.
    Finished,
    /// Something went wrong; shut down on error.
    Error,
}

/// Lifecycle status of a registered state machine, mirroring what a caller
/// can observe from outside: whether it is queued, running, or has
/// stopped, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    None,
    WaitingForActivation,
    Running,
    RunningAndInitialized,
    RunningAndWaitingForDeactivation,
    StoppedOnError,
    StoppedGracefully,
}

/// Per-call context handed to a state's `state_function`/`transition_function`.
///
/// `argument` is fixed for the whole run (set by `Statemachine::start`);
/// `signal` is consumed the moment a `transition_function` observes it.
pub struct Context {
    argument: i32,
    signal: Option<i32>,
    now: u64,
    state_entered_at: u64,
    statemachine_start_time: u64,
}

impl Context {
    pub fn argument(&self) -> i32 {
        self.argument
    }

    pub fn has_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// Takes the pending signal, if any. A signal is visible to exactly one
    /// `transition_function` call.
    pub fn take_signal(&mut self) -> Option<i32> {
        self.signal.take()
    }

    /// Current tick, as passed to `Statemachine::process`/`Engine::tick`.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Ticks elapsed since the current state was entered.
    pub fn ticks_in_state(&self) -> u64 {
        self.now.saturating_sub(self.state_entered_at)
    }

    /// Ticks elapsed since the owning state machine was activated.
    pub fn ticks_running(&self) -> u64 {
        self.now.saturating_sub(self.statemachine_start_time)
    }
}

/// One state of a state machine. `E` is the event type emitted on the
/// standard lifecycle transitions (successful initialization, graceful
/// shutdown, error shutdown); a state may override any of them.
pub trait State<E> {
    fn name(&self) -> &'static str {
        "state"
    }

    /// Do the state's work. Returning `false` aborts the whole run.
    fn state_function(&mut self, ctx: &Context) -> bool;

    /// Decide what happens next.
    fn transition_function(&mut self, ctx: &mut Context) -> Transition;

    fn on_successful_initialization(&self) -> Option<E> {
        None
    }

    fn on_graceful_shutdown(&self) -> Option<E> {
        None
    }

    fn on_error_shutdown(&self) -> Option<E> {
        None
    }
}

/// A state that always succeeds after waiting out a fixed number of ticks,
/// then transitions to a fixed follow-up state.
pub struct DelayState {
    ticks: u64,
    next: StateId,
}

impl DelayState {
    pub fn new(ticks: u64, next: StateId) -> Self {
        DelayState { ticks, next }
    }
}

impl<E> State<E> for DelayState {
    fn name(&self) -> &'static str {
        "DelayState"
    }

    fn state_function(&mut self, _ctx: &Context) -> bool {
        true
    }

    fn transition_function(&mut self, ctx: &mut Context) -> Transition {
        if ctx.ticks_in_state() >= self.ticks {
            Transition::To(self.next)
        } else {
            Transition::Stay
        }
    }
}

/// A state that idles until a signal arrives, then hands it to a callback
/// that decides the follow-up state.
pub struct WaitForSignalState<F: FnMut(i32) -> StateId> {
    on_signal: F,
}

impl<F: FnMut(i32) -> StateId> WaitForSignalState<F> {
    pub fn new(on_signal: F) -> Self {
        WaitForSignalState { on_signal }
    }
}

impl<E, F: FnMut(i32) -> StateId> State<E> for WaitForSignalState<F> {
    fn name(&self) -> &'static str {
        "WaitForSignalState"
    }

    fn state_function(&mut self, _ctx: &Context) -> bool {
        true
    }

    fn transition_function(&mut self, ctx: &mut Context) -> Transition {
        match ctx.take_signal() {
            Some(signal) => Transition::To((self.on_signal)(signal)),
            None => Transition::Stay,
        }
    }
}

/// A tick-driven, cooperatively scheduled state machine.
///
/// `N` bounds the number of registered states. States are borrowed for the
/// machine's lifetime rather than boxed, matching the no-heap posture of
/// the rest of this crate family.
pub struct Statemachine<'a, E, const N: usize> {
    name: &'static str,
    states: HVec<&'a mut dyn State<E>, N>,
    entry_state: StateId,
    initialized_state: Option<StateId>,
    abort_state: Option<StateId>,
    on_successful_initialization: Option<E>,
    on_graceful_shutdown: Option<E>,
    on_error_shutdown: Option<E>,
    on_event: Option<&'a mut dyn FnMut(E)>,
    status: Status,
    argument: i32,
    signal: Option<i32>,
    current_state: Option<StateId>,
    start_time: u64,
    state_entered_at: u64,
}

impl<'a, E: Copy, const N: usize> Statemachine<'a, E, N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &'static str,
        entry_state: StateId,
        initialized_state: Option<StateId>,
        abort_state: Option<StateId>,
        on_successful_initialization: Option<E>,
        on_graceful_shutdown: Option<E>,
        on_error_shutdown: Option<E>,
    ) -> Self {
        Statemachine {
            name,
            states: HVec::new(),
            entry_state,
            initialized_state,
            abort_state,
            on_successful_initialization,
            on_graceful_shutdown,
            on_error_shutdown,
            on_event: None,
            status: Status::None,
            argument: 0,
            signal: None,
            current_state: None,
            start_time: 0,
            state_entered_at: 0,
        }
    }

    pub fn with_event_handler(mut self, handler: &'a mut dyn FnMut(E)) -> Self {
        self.on_event = Some(handler);
        self
    }

    /// Registers a state and returns the handle used to refer to it from
    /// `transition_function` implementations and from `new`'s
    /// `entry_state`/`initialized_state`/`abort_state` arguments.
    ///
    /// States must be registered in the same order their `StateId`s are
    /// constructed by the caller (index 0 first); returns `false` if `N`
    /// registered states is exceeded.
    pub fn add_state(&mut self, state: &'a mut dyn State<E>) -> Option<StateId> {
        let id = StateId(self.states.len());
        self.states.push(state).ok()?;
        Some(id)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            Status::Running
                | Status::RunningAndInitialized
                | Status::WaitingForActivation
                | Status::RunningAndWaitingForDeactivation
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status,
            Status::Running | Status::RunningAndInitialized | Status::RunningAndWaitingForDeactivation
        )
    }

    pub fn running_time(&self, now: u64) -> u64 {
        if self.is_running() {
            now.saturating_sub(self.start_time)
        } else {
            0
        }
    }

    /// Queues the state machine for activation on the next `process` tick.
    /// A no-op (beyond logging) if already queued, running, or waiting to
    /// be deactivated, matching the original's "don't double-start" rules.
    pub fn start(&mut self, argument: i32) {
        self.argument = argument;

        match self.status {
            Status::WaitingForActivation => {
                log::info!("{}: not added: already in activation queue", self.name);
            }
            Status::RunningAndWaitingForDeactivation => {
                log::error!("{}: not added: waiting to be deactivated", self.name);
            }
            Status::Running => {
                log::info!("{}: not added: already running", self.name);
            }
            Status::RunningAndInitialized => {
                log::info!("{}: not added: already running", self.name);
                self.emit(self.on_successful_initialization);
            }
            _ => {
                self.status = Status::WaitingForActivation;
            }
        }
    }

    /// Queues the state machine for deactivation (running the abort state)
    /// on the next `process` tick.
    pub fn stop(&mut self) {
        match self.status {
            Status::RunningAndWaitingForDeactivation => {
                log::info!("{}: not added: already in deactivation queue", self.name);
            }
            Status::WaitingForActivation => {
                log::error!("{}: not stopped: already in activation queue", self.name);
            }
            Status::RunningAndInitialized | Status::Running => {
                self.status = Status::RunningAndWaitingForDeactivation;
            }
            _ => {
                log::info!("{}: not stopped: wasn't running", self.name);
            }
        }
    }

    /// Delivers a signal to the currently running state. Returns `false`
    /// (and drops the signal) if the state machine isn't running.
    pub fn send_signal(&mut self, signal: i32) -> bool {
        if self.is_running() {
            self.signal = Some(signal);
            true
        } else {
            false
        }
    }

    fn emit(&mut self, event: Option<E>) {
        if let (Some(event), Some(handler)) = (event, self.on_event.as_deref_mut()) {
            handler(event);
        }
    }

    fn change_state(&mut self, next: Option<StateId>, now: u64) -> bool {
        let Some(next_id) = next else {
            return false;
        };
        let ctx = Context {
            argument: self.argument,
            signal: None,
            now,
            state_entered_at: now,
            statemachine_start_time: self.start_time,
        };
        let success = self.states[next_id.0].state_function(&ctx);

        if success {
            self.state_entered_at = now;
            match self.current_state {
                Some(cur) => log::info!(
                    "{}: {} --> {}",
                    self.name,
                    self.states[cur.0].name(),
                    self.states[next_id.0].name()
                ),
                None => log::info!("{}: entered initial state: {}", self.name, self.states[next_id.0].name()),
            }

            if Some(next_id) == self.initialized_state && self.status == Status::Running {
                let event = self.states[next_id.0]
                    .on_successful_initialization()
                    .or(self.on_successful_initialization);
                self.emit(event);
                self.status = Status::RunningAndInitialized;
            }

            self.current_state = Some(next_id);
            true
        } else {
            log::error!("{}: statechange failed", self.name);
            false
        }
    }

    /// Runs one scheduler tick: activates queued machines, deactivates
    /// machines queued for shutdown, then drives the currently active
    /// machine's `transition_function` (and, on `Transition::Redo`, its
    /// `state_function` again). `now` is a monotonically increasing tick
    /// counter supplied by the caller.
    pub fn process(&mut self, now: u64) {
        if self.status == Status::WaitingForActivation {
            if self.change_state(Some(self.entry_state), now) {
                self.start_time = now;
                self.status = Status::Running;
                log::info!("{} activated", self.name);
            } else {
                self.status = Status::StoppedOnError;
                self.emit(self.on_error_shutdown);
                log::error!("{}: couldn't be activated", self.name);
            }
        }

        if self.status == Status::RunningAndWaitingForDeactivation
            && !self.change_state(self.abort_state, now)
        {
            self.current_state = None;
            self.status = Status::StoppedOnError;
            self.emit(self.on_error_shutdown);
            log::info!("{}: couldn't enter abortstate -> cancelled", self.name);
        }

        if matches!(self.status, Status::Running | Status::RunningAndInitialized) {
            let Some(cur) = self.current_state else {
                return;
            };

            let mut ctx = Context {
                argument: self.argument,
                signal: self.signal.take(),
                now,
                state_entered_at: self.state_entered_at,
                statemachine_start_time: self.start_time,
            };
            let transition = self.states[cur.0].transition_function(&mut ctx);

            match transition {
                Transition::Stay => {}
                Transition::Error => {
                    self.current_state = None;
                    self.status = Status::StoppedOnError;
                    self.emit(self.on_error_shutdown);
                    log::info!("{} cancelled on error", self.name);
                }
                Transition::Finished => {
                    self.current_state = None;
                    self.status = Status::StoppedGracefully;
                    self.emit(self.on_graceful_shutdown);
                    log::info!("{} finished", self.name);
                }
                Transition::Redo => {
                    log::warn!("{}: Do Statefunc again", self.name);
                    let redo_ctx = Context {
                        argument: self.argument,
                        signal: None,
                        now,
                        state_entered_at: self.state_entered_at,
                        statemachine_start_time: self.start_time,
                    };
                    if !self.states[cur.0].state_function(&redo_ctx) {
                        self.current_state = None;
                        self.status = Status::StoppedOnError;
                        self.emit(self.on_error_shutdown);
                        log::info!("{} cancelled on error", self.name);
                    }
                }
                Transition::To(next) => {
                    if next != cur && !self.change_state(Some(next), now) {
                        self.current_state = None;
                        self.status = Status::StoppedOnError;
                        self.emit(self.on_error_shutdown);
                        log::info!("{} cancelled on error", self.name);
                    }
                }
            }
        }
    }
}

/// Drives a fixed set of independently-owned state machines, tick by tick.
/// `N` bounds how many machines may be registered.
pub struct Engine<'a, E, const N: usize> {
    machines: HVec<&'a mut dyn Tickable<E>, N>,
}

/// Object-safe view of a [`Statemachine`], erasing its state-count const
/// generic so heterogeneous machines can share one [`Engine`].
pub trait Tickable<E> {
    fn tick(&mut self, now: u64);
}

impl<'a, E: Copy, const N: usize> Tickable<E> for Statemachine<'a, E, N> {
    fn tick(&mut self, now: u64) {
        self.process(now);
    }
}

impl<'a, E, const N: usize> Engine<'a, E, N> {
    pub fn new() -> Self {
        Engine { machines: HVec::new() }
    }

    pub fn register(&mut self, machine: &'a mut dyn Tickable<E>) -> bool {
        self.machines.push(machine).is_ok()
    }

    pub fn tick(&mut self, now: u64) {
        for machine in self.machines.iter_mut() {
            machine.tick(now);
        }
    }
}

impl<'a, E, const N: usize> Default for Engine<'a, E, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Initialized,
        Done,
        Failed,
    }

    struct AlwaysGoTo {
        target: StateId,
        to_finished: bool,
    }

    impl State<Event> for AlwaysGoTo {
        fn transition_function(&mut self, _ctx: &mut Context) -> Transition {
            if self.to_finished {
                Transition::Finished
            } else {
                Transition::To(self.target)
            }
        }

        fn state_function(&mut self, _ctx: &Context) -> bool {
            true
        }
    }

    struct FailingState;

    impl State<Event> for FailingState {
        fn state_function(&mut self, _ctx: &Context) -> bool {
            false
        }

        fn transition_function(&mut self, _ctx: &mut Context) -> Transition {
            Transition::Stay
        }
    }

    #[test]
    fn start_runs_entry_state_same_tick_and_reaches_finished() {
        let mut entry = AlwaysGoTo {
            target: StateId(0),
            to_finished: true,
        };
        let mut sm: Statemachine<Event, 2> =
            Statemachine::new("test", StateId(0), None, None, None, Some(Event::Done), None);
        let entry_id = sm.add_state(&mut entry).unwrap();
        assert_eq!(entry_id, StateId(0));

        sm.start(0);
        assert_eq!(sm.status(), Status::WaitingForActivation);

        sm.process(10);
        assert_eq!(sm.status(), Status::StoppedGracefully);
    }

    #[test]
    fn reaching_initialized_state_emits_event_once() {
        let mut events = HVec::<Event, 4>::new();
        let mut handler = |e: Event| {
            let _ = events.push(e);
        };

        let mut step2 = AlwaysGoTo {
            target: StateId(1),
            to_finished: false,
        };
        let mut step1 = AlwaysGoTo {
            target: StateId(1),
            to_finished: false,
        };

        let mut sm: Statemachine<Event, 2> = Statemachine::new(
            "init_test",
            StateId(0),
            Some(StateId(1)),
            None,
            Some(Event::Initialized),
            None,
            None,
        )
        .with_event_handler(&mut handler);
        sm.add_state(&mut step1).unwrap();
        sm.add_state(&mut step2).unwrap();

        sm.start(0);
        sm.process(0);

        assert_eq!(sm.status(), Status::RunningAndInitialized);
    }

    #[test]
    fn activation_failure_stops_on_error() {
        let mut bad = FailingState;
        let mut sm: Statemachine<Event, 1> =
            Statemachine::new("bad", StateId(0), None, None, None, None, Some(Event::Failed));
        sm.add_state(&mut bad).unwrap();

        sm.start(0);
        sm.process(0);

        assert_eq!(sm.status(), Status::StoppedOnError);
    }

    #[test]
    fn send_signal_is_rejected_when_not_running() {
        let mut idle = FailingState;
        let mut sm: Statemachine<Event, 1> =
            Statemachine::new("idle", StateId(0), None, None, None, None, None);
        sm.add_state(&mut idle).unwrap();

        assert!(!sm.send_signal(5));
    }

    #[test]
    fn wait_for_signal_state_holds_until_signalled() {
        let mut waiting = WaitForSignalState::new(|_signal: i32| StateId(0));
        let mut sm: Statemachine<Event, 1> =
            Statemachine::new("waiter", StateId(0), None, None, None, Some(Event::Done), None);
        sm.add_state(&mut waiting).unwrap();

        sm.start(0);
        sm.process(0);
        assert_eq!(sm.status(), Status::Running);

        sm.process(1);
        assert_eq!(sm.status(), Status::Running);

        assert!(sm.send_signal(42));
        sm.process(2);
        assert_eq!(sm.status(), Status::Running);
    }

    #[test]
    fn engine_ticks_all_registered_machines() {
        let mut a_state = AlwaysGoTo {
            target: StateId(0),
            to_finished: true,
        };
        let mut b_state = AlwaysGoTo {
            target: StateId(0),
            to_finished: true,
        };

        let mut a: Statemachine<Event, 1> = Statemachine::new("a", StateId(0), None, None, None, None, None);
        a.add_state(&mut a_state).unwrap();
        let mut b: Statemachine<Event, 1> = Statemachine::new("b", StateId(0), None, None, None, None, None);
        b.add_state(&mut b_state).unwrap();

        a.start(0);
        b.start(0);

        let mut engine: Engine<Event, 2> = Engine::new();
        engine.register(&mut a);
        engine.register(&mut b);
        engine.tick(0);

        assert_eq!(a.status(), Status::StoppedGracefully);
        assert_eq!(b.status(), Status::StoppedGracefully);
    }
}
