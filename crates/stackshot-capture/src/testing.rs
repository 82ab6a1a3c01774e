//! In-memory stand-ins for threads, stacks and registers.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use stackshot_types::{NativeThreadId, ThreadMetadata};

use crate::arch::{Architecture, ContextOf};
use crate::bounds::StackBounds;
use crate::frame::{StackMemory, WORD_SIZE};
use crate::metadata::MetadataResolver;
use crate::thread::{
    ContextError, FrozenView, SuspendError, ThreadHandle, ThreadList, ThreadSource,
};

pub const STACK_LOW: usize = 0x7000_0000;
pub const STACK_HIGH: usize = 0x7000_2000;
pub const F0: usize = 0x7000_1000;
pub const F1: usize = 0x7000_1100;
pub const F2: usize = 0x7000_1200;
pub const PC: usize = 0x4000_0010;

thread_local! {
    static CURRENT_FRAME: Cell<usize> = const { Cell::new(0) };
}

pub fn set_current_frame(address: usize) {
    CURRENT_FRAME.with(|frame| frame.set(address));
}

#[derive(Debug, Clone, Copy)]
pub struct FakeArch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeContext {
    pub pc: usize,
    pub fp: usize,
    pub lr: Option<usize>,
}

impl Architecture for FakeArch {
    type Context = FakeContext;

    const NAME: &'static str = "fake";

    fn program_counter(context: &Self::Context) -> usize {
        context.pc
    }

    fn frame_pointer(context: &Self::Context) -> usize {
        context.fp
    }

    fn link_register(context: &Self::Context) -> Option<usize> {
        context.lr
    }

    fn current_frame_address() -> usize {
        CURRENT_FRAME.with(|frame| frame.get())
    }

    fn current_context() -> Option<Self::Context> {
        None
    }
}

/// Sparse stack; words never written read as zero.
#[derive(Debug, Clone)]
pub struct FakeStack {
    bounds: StackBounds,
    words: BTreeMap<usize, usize>,
}

impl FakeStack {
    pub fn new(bounds: StackBounds) -> Self {
        Self {
            bounds,
            words: BTreeMap::new(),
        }
    }

    /// f0 -> f1 -> f2, returning to 0x1000, 0x2000 and 0x3000; f2 ends the chain.
    pub fn three_frames() -> Self {
        let mut stack = Self::new(StackBounds::new(STACK_LOW, STACK_HIGH));
        stack.write_frame(F0, F1, 0x1000);
        stack.write_frame(F1, F2, 0x2000);
        stack.write_frame(F2, 0, 0x3000);
        stack
    }

    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    pub fn write(&mut self, address: usize, value: usize) {
        self.words.insert(address, value);
    }

    pub fn write_frame(&mut self, address: usize, next: usize, return_address: usize) {
        self.write(address, next);
        self.write(address + WORD_SIZE, return_address);
    }
}

impl StackMemory for FakeStack {
    fn read_word(&self, address: usize) -> Option<usize> {
        if !self.bounds.contains_range(address, WORD_SIZE) {
            return None;
        }
        Some(self.words.get(&address).copied().unwrap_or(0))
    }
}

/// A stopped thread for driving `backtrace` directly.
pub struct FakeView {
    pub id: NativeThreadId,
    pub context: Result<FakeContext, ContextError>,
    pub stack: FakeStack,
}

impl FakeView {
    pub fn three_frames() -> Self {
        Self {
            id: NativeThreadId::from_raw(1),
            context: Ok(FakeContext {
                pc: PC,
                fp: F0,
                lr: None,
            }),
            stack: FakeStack::three_frames(),
        }
    }
}

impl StackMemory for FakeView {
    fn read_word(&self, address: usize) -> Option<usize> {
        self.stack.read_word(address)
    }
}

impl FrozenView for FakeView {
    type Arch = FakeArch;

    fn native_id(&self) -> NativeThreadId {
        self.id
    }

    fn machine_context(&self) -> Result<ContextOf<FakeArch>, ContextError> {
        self.context
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Resolve(u64),
    Bounds(u64),
    Clock,
    Suspend(u64),
    Context(u64),
    Read(u64),
    Resume(u64),
    Deliver(u64),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

pub fn resolver(log: &EventLog) -> impl MetadataResolver + use<> {
    let log = log.clone();
    move |thread: NativeThreadId| {
        log.push(Event::Resolve(thread.get()));
        if thread.get() == 0 {
            ThreadMetadata::unresolved()
        } else {
            ThreadMetadata::new(thread.get(), format!("thread-{thread}"), 0)
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeThread {
    id: u64,
    idle: bool,
    bounds: StackBounds,
    stack: FakeStack,
    context: Result<FakeContext, ContextError>,
    suspend_result: Result<(), SuspendError>,
    suspended: bool,
    log: EventLog,
}

impl FakeThread {
    pub fn walkable(log: &EventLog, id: u64) -> Self {
        let stack = FakeStack::three_frames();
        Self {
            id,
            idle: false,
            bounds: stack.bounds(),
            stack,
            context: Ok(FakeContext {
                pc: PC,
                fp: F0,
                lr: None,
            }),
            suspend_result: Ok(()),
            suspended: false,
            log: log.clone(),
        }
    }

    pub fn exited(mut self) -> Self {
        self.suspend_result = Err(SuspendError::ThreadExited);
        self
    }

    pub fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    pub fn with_bounds(mut self, bounds: StackBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_context(mut self, context: Result<FakeContext, ContextError>) -> Self {
        self.context = context;
        self
    }

    pub fn with_frame_pointer(mut self, fp: usize) -> Self {
        if let Ok(context) = self.context.as_mut() {
            context.fp = fp;
        }
        self
    }

    /// Replaces the stack with a chain deeper than any depth limit.
    pub fn deep(mut self, frames: usize) -> Self {
        let mut stack = FakeStack::new(StackBounds::new(STACK_LOW, STACK_HIGH));
        for i in 0..frames {
            let address = STACK_LOW + 0x100 + i * 0x20;
            let next = if i + 1 == frames { 0 } else { address + 0x20 };
            stack.write_frame(address, next, 0x10_000 + i * 0x10);
        }
        self.bounds = stack.bounds();
        self.stack = stack;
        self.with_frame_pointer(STACK_LOW + 0x100)
    }
}

impl ThreadHandle for FakeThread {
    type Arch = FakeArch;

    fn native_id(&self) -> NativeThreadId {
        NativeThreadId::from_raw(self.id)
    }

    fn is_idle(&self) -> bool {
        self.idle
    }

    fn stack_bounds(&self) -> StackBounds {
        self.log.push(Event::Bounds(self.id));
        self.bounds
    }

    fn suspend(&mut self) -> Result<(), SuspendError> {
        self.log.push(Event::Suspend(self.id));
        self.suspend_result?;
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) {
        assert!(self.suspended, "resume without a matching suspend");
        self.suspended = false;
        self.log.push(Event::Resume(self.id));
    }

    fn machine_context(&self) -> Result<FakeContext, ContextError> {
        self.log.push(Event::Context(self.id));
        if !self.suspended {
            return Err(ContextError::NotSuspended);
        }
        self.context
    }

    unsafe fn read_stack_word(&self, address: usize) -> usize {
        assert!(self.suspended, "stack read on a running thread");
        self.log.push(Event::Read(self.id));
        self.stack.read_word(address).unwrap_or(0)
    }
}

pub struct FakeSource {
    log: EventLog,
    threads: Vec<FakeThread>,
    current: NativeThreadId,
    clock: Cell<u64>,
}

impl FakeSource {
    pub fn new(log: &EventLog, threads: Vec<FakeThread>) -> Self {
        Self {
            log: log.clone(),
            threads,
            current: NativeThreadId::from_raw(u64::MAX),
            clock: Cell::new(1_000),
        }
    }

    pub fn template(&self, index: usize) -> FakeThread {
        self.threads[index].clone()
    }
}

impl ThreadSource for FakeSource {
    type Thread = FakeThread;

    fn all_excluding_current(&self) -> ThreadList<FakeThread> {
        ThreadList {
            threads: self.threads.clone(),
            current: self.current,
        }
    }

    fn absolute_time(&self) -> u64 {
        self.log.push(Event::Clock);
        let now = self.clock.get();
        self.clock.set(now + 1_000);
        now
    }
}
