//! # IrqOS Example Firmware
//!
//! Demonstrates the kernel with four threads and one periodic alarm:
//!
//! | Thread | Priority | Behavior |
//! |--------|----------|----------|
//! | `button_thread` | 2 | Blocks until the EXTI0 interrupt fires |
//! | `sampler_thread` | 4 | Receives a message from every alarm firing |
//! | `worker_thread` | 8 | Does a burst of work, then sleeps 100 ms |
//! | `background_thread` | 20 | Counts and yields |
//!
//! The alarm runs in interrupt context every 50 ms and only posts a
//! sequence number into a mailbox; the sampler thread does the rest. Nothing
//! switches threads except interrupt returns.
//!
//! On a host target this binary is empty: the kernel is exercised there
//! by its unit tests.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod firmware {
    use core::ptr::addr_of_mut;
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m_rt::entry;
    use panic_halt as _;

    use irqos::alarm::{ms_to_ticks, AlarmAction};
    use irqos::api;
    use irqos::irq::{Handler, IrqSource};
    use irqos::scheduler::Scheduler;
    use irqos::{Mailbox, Priority, Stack};

    /// EXTI0 is NVIC line 6; kernel source numbers are line + 1.
    const BUTTON: IrqSource = IrqSource::new(7);

    const STACK_WORDS: usize = 128;

    static SAMPLES: Mailbox<u32, 8> = Mailbox::new();
    static SAMPLE_SEQ: AtomicU32 = AtomicU32::new(0);

    static PRESSES: AtomicU32 = AtomicU32::new(0);
    static SAMPLED: AtomicU32 = AtomicU32::new(0);
    static WORK_DONE: AtomicU32 = AtomicU32::new(0);
    static IDLE_LOOPS: AtomicU32 = AtomicU32::new(0);

    static mut BUTTON_STACK: [u64; STACK_WORDS] = [0; STACK_WORDS];
    static mut SAMPLER_STACK: [u64; STACK_WORDS] = [0; STACK_WORDS];
    static mut WORKER_STACK: [u64; STACK_WORDS] = [0; STACK_WORDS];
    static mut BACKGROUND_STACK: [u64; STACK_WORDS] = [0; STACK_WORDS];

    // -----------------------------------------------------------------------
    // Interrupt-context work
    // -----------------------------------------------------------------------

    /// Alarm callback. Posts a sequence number without blocking; if the
    /// sampler has fallen behind, the sample is dropped.
    fn post_sample(sched: &mut Scheduler, _: usize) {
        let seq = SAMPLE_SEQ.fetch_add(1, Ordering::Relaxed);
        let _ = SAMPLES.post(sched, seq);
    }

    // -----------------------------------------------------------------------
    // Thread entry points
    // -----------------------------------------------------------------------

    /// **Button Thread** (Priority 2)
    ///
    /// Sleeps until the button interrupt has fired at least once since it
    /// last looked. The handler is `Handler::Notify`: dispatch itself
    /// latches the check flag and wakes interrupt waiters.
    fn button_thread(_: usize) {
        loop {
            api::wait_irq(true, BUTTON.mask());
            PRESSES.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// **Sampler Thread** (Priority 4)
    ///
    /// Blocking receive on the mailbox the alarm feeds.
    fn sampler_thread(_: usize) {
        while let Ok(seq) = SAMPLES.receive() {
            SAMPLED.store(seq, Ordering::Relaxed);
        }
    }

    /// **Worker Thread** (Priority 8)
    ///
    /// Periodic work paced by `sleep` rather than busy-waiting.
    fn worker_thread(_: usize) {
        loop {
            let mut work: u32 = 0;
            for _ in 0..5000 {
                work = work.wrapping_add(1);
            }
            WORK_DONE.fetch_add(work, Ordering::Relaxed);
            api::sleep(ms_to_ticks(100));
        }
    }

    /// **Background Thread** (Priority 20)
    ///
    /// Runs only when everything above it is blocked. Never blocks itself,
    /// so the idle thread below it never runs.
    fn background_thread(_: usize) {
        loop {
            IDLE_LOOPS.fetch_add(1, Ordering::Relaxed);
            api::yield_now();
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Firmware entry point. Initializes the kernel, creates threads and
    /// the alarm, and starts the scheduler. Does not return.
    #[entry]
    fn main() -> ! {
        let cp = cortex_m::Peripherals::take().expect("core peripherals already taken");

        api::init();

        // SAFETY: each stack is handed to exactly one thread, once.
        let stacks = unsafe {
            [
                Stack::new(&mut *addr_of_mut!(BUTTON_STACK)),
                Stack::new(&mut *addr_of_mut!(SAMPLER_STACK)),
                Stack::new(&mut *addr_of_mut!(WORKER_STACK)),
                Stack::new(&mut *addr_of_mut!(BACKGROUND_STACK)),
            ]
        };
        let threads: [(fn(usize), u8); 4] = [
            (button_thread, 2),
            (sampler_thread, 4),
            (worker_thread, 8),
            (background_thread, 20),
        ];
        for ((entry, level), stack) in threads.into_iter().zip(stacks) {
            let priority = Priority::new(level).expect("priority in range");
            api::create_thread(entry, 0, stack, priority).expect("failed to create thread");
        }

        api::install_handler(BUTTON, Some(Handler::Notify));
        api::enable_irq(BUTTON.mask());

        api::set_periodic_alarm(0, ms_to_ticks(50), AlarmAction::Call(post_sample, 0))
            .expect("failed to arm sampling alarm");

        api::start(cp)
    }
}
