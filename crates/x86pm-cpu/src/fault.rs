//! Protection faults, the sticky pending-abort state, and exception escalation.
//!
//! Every check in the loader, the gate dispatcher and the task switcher raises
//! through [`CpuContext::raise`], which records the fault as pending and hands
//! the typed value back for `?` propagation. Nothing on the stack or in the
//! registers changes at the raise site; [`CpuContext::deliver_pending_fault`]
//! is the single point that turns a pending fault into interrupt dispatch.

use thiserror::Error;
use x86pm_mmu::{MemoryBus, PageFault};

use crate::gate::InterruptSource;
use crate::CpuContext;

/// Architecturally defined exception vectors raised by this engine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,        // #DE
    DoubleFault = 8,        // #DF
    InvalidTss = 10,        // #TS
    SegmentNotPresent = 11, // #NP
    StackFault = 12,        // #SS
    GeneralProtection = 13, // #GP
    PageFault = 14,         // #PF
}

impl Exception {
    #[inline]
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        !matches!(self, Exception::DivideError)
    }
}

/// A protection fault. Selector-carrying variants hold the architectural
/// error code (selector with the RPL bits cleared, or a vector-derived code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Fault {
    #[error("general protection fault (error code {0:#06x})")]
    GeneralProtection(u16),

    #[error("segment not present (error code {0:#06x})")]
    NotPresent(u16),

    #[error("stack fault (error code {0:#06x})")]
    StackFault(u16),

    #[error("invalid TSS (error code {0:#06x})")]
    InvalidTss(u16),

    #[error("page fault at {addr:#010x} (error code {error_code:#x})")]
    PageFault { addr: u32, error_code: u32 },

    #[error("divide error")]
    DivideError,

    #[error("double fault")]
    DoubleFault,
}

impl Fault {
    pub const fn exception(self) -> Exception {
        match self {
            Fault::GeneralProtection(_) => Exception::GeneralProtection,
            Fault::NotPresent(_) => Exception::SegmentNotPresent,
            Fault::StackFault(_) => Exception::StackFault,
            Fault::InvalidTss(_) => Exception::InvalidTss,
            Fault::PageFault { .. } => Exception::PageFault,
            Fault::DivideError => Exception::DivideError,
            Fault::DoubleFault => Exception::DoubleFault,
        }
    }

    pub const fn error_code(self) -> Option<u32> {
        match self {
            Fault::GeneralProtection(code)
            | Fault::NotPresent(code)
            | Fault::StackFault(code)
            | Fault::InvalidTss(code) => Some(code as u32),
            Fault::PageFault { error_code, .. } => Some(error_code),
            Fault::DoubleFault => Some(0),
            Fault::DivideError => None,
        }
    }
}

impl From<PageFault> for Fault {
    fn from(pf: PageFault) -> Self {
        Fault::PageFault {
            addr: pf.addr,
            error_code: pf.error_code,
        }
    }
}

/// Conditions that stop the CPU instead of being delivered to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuExit {
    /// A fault while delivering #DF. The embedder is expected to reset.
    #[error("triple fault")]
    TripleFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    fn of(exception: Exception) -> Self {
        match exception {
            Exception::PageFault => Self::PageFault,
            Exception::DoubleFault => Self::DoubleFault,
            Exception::DivideError
            | Exception::InvalidTss
            | Exception::SegmentNotPresent
            | Exception::StackFault
            | Exception::GeneralProtection => Self::Contributory,
        }
    }
}

fn should_double_fault(first: Exception, second: Exception) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory | C::PageFault)
            | (C::PageFault, C::Contributory | C::PageFault)
    )
}

impl CpuContext {
    /// Record `fault` as the pending abort and return it.
    pub(crate) fn raise(&mut self, fault: Fault) -> Fault {
        tracing::debug!(
            exception = ?fault.exception(),
            error_code = ?fault.error_code(),
            eip = self.eip,
            "fault raised"
        );
        self.pending = Some(fault);
        fault
    }

    pub fn gp(&mut self, code: u16) -> Fault {
        self.raise(Fault::GeneralProtection(code))
    }

    pub fn np(&mut self, code: u16) -> Fault {
        self.raise(Fault::NotPresent(code))
    }

    pub fn ss(&mut self, code: u16) -> Fault {
        self.raise(Fault::StackFault(code))
    }

    pub fn ts(&mut self, code: u16) -> Fault {
        self.raise(Fault::InvalidTss(code))
    }

    pub fn de(&mut self) -> Fault {
        self.raise(Fault::DivideError)
    }

    #[inline]
    pub fn abort_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[inline]
    pub fn pending_fault(&self) -> Option<Fault> {
        self.pending
    }

    pub fn take_pending_fault(&mut self) -> Option<Fault> {
        self.pending.take()
    }

    /// Deliver the pending fault, if any, through the IDT (or IVT in real mode).
    ///
    /// The saved return address is the current `eip`, which still points at the
    /// faulting instruction. A contributory or page fault raised while a
    /// contributory or page fault is being delivered becomes #DF(0); any fault
    /// while delivering #DF stops the CPU.
    pub fn deliver_pending_fault(&mut self, bus: &mut impl MemoryBus) -> Result<(), CpuExit> {
        let mut delivering: Option<Exception> = None;
        while let Some(fault) = self.pending.take() {
            let mut exception = fault.exception();
            let mut error_code = fault.error_code();

            if let Some(first) = delivering {
                if first == Exception::DoubleFault {
                    tracing::warn!(?fault, eip = self.eip, "triple fault");
                    return Err(CpuExit::TripleFault);
                }
                if exception != Exception::DoubleFault && should_double_fault(first, exception) {
                    exception = Exception::DoubleFault;
                    error_code = Some(0);
                }
            }

            delivering = Some(exception);
            let return_eip = self.eip;
            if self
                .dispatch_vector(
                    bus,
                    exception.vector(),
                    InterruptSource::External,
                    error_code,
                    return_eip,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        Ok(())
    }
}
