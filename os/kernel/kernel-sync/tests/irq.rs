//! The simulated interrupt flag is process-wide, so everything that toggles it
//! lives in this single test.

use kernel_sync::irq::{self, IrqGuard, cli_stop_interrupts, sti_enable_interrupts};
use kernel_sync::{interrupts_enabled, without_interrupts};
use std::panic;

#[test]
fn nested_guards_restore_the_outer_state() {
    // Boot state: interrupts masked. Guards must not turn them on.
    cli_stop_interrupts();
    {
        let g = IrqGuard::new();
        assert!(!g.were_enabled());
        assert!(!interrupts_enabled());
    }
    assert!(!interrupts_enabled());

    // Enabled: the outer guard masks, the inner one sees them masked already.
    sti_enable_interrupts();
    assert!(interrupts_enabled());
    assert_ne!(irq::eflags() & irq::EFLAGS_IF, 0);
    {
        let outer = IrqGuard::new();
        assert!(outer.were_enabled());
        assert!(!interrupts_enabled());
        {
            let inner = IrqGuard::new();
            assert!(!inner.were_enabled());
        }
        // dropping the inner guard must not re-enable early
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    // Closure form.
    let seen = without_interrupts(interrupts_enabled);
    assert!(!seen);
    assert!(interrupts_enabled());

    // A panic inside the critical section still restores the flag.
    let res = panic::catch_unwind(|| {
        let _g = IrqGuard::new();
        panic!("boom");
    });
    assert!(res.is_err());
    assert!(interrupts_enabled());

    cli_stop_interrupts();
}
