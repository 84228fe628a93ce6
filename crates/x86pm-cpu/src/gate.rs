//! Far control transfers: far JMP/CALL through code segments, call gates and
//! task gates; interrupt and exception dispatch through the IDT or IVT; far
//! RET and IRET, including the virtual-8086 entry and exit paths.
//!
//! Every protected-mode transfer walks the same stages. The target is
//! validated first, the frame is then built on a staged copy of the
//! destination stack, and SS:ESP, CS:EIP and EFLAGS are only written once
//! the whole frame is in memory. A fault in any stage leaves the registers as
//! they were before the instruction.

use x86pm_mmu::{AccessContext, MemoryBus};

use crate::descriptor::{Descriptor, DescriptorKind, Gate};
use crate::fault::Fault;
use crate::segment::{SegReg, SegmentCache};
use crate::state::{CpuMode, Eflags, Gpr, FLAGS_LOW_WRITABLE};
use crate::task::TaskSwitchReason;
use crate::CpuContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// INT n, INT3, INTO. The gate DPL is checked against CPL.
    Software,
    /// Hardware interrupts and CPU exceptions.
    External,
}

impl InterruptSource {
    /// EXT bit of selector error codes.
    #[inline]
    fn ext(self) -> u16 {
        match self {
            InterruptSource::Software => 0,
            InterruptSource::External => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarKind {
    Jmp,
    /// `op32` sets the width of the return address a direct call pushes.
    /// Calls through a gate use the gate size instead.
    Call { op32: bool },
}

impl FarKind {
    fn task_switch_reason(self) -> TaskSwitchReason {
        match self {
            FarKind::Jmp => TaskSwitchReason::Jmp,
            FarKind::Call { .. } => TaskSwitchReason::Call,
        }
    }
}

/// EFLAGS bits above the low word that a 32-bit IRET restores.
const IRET_UPPER: u32 = Eflags::RF.bits()
    | Eflags::AC.bits()
    | Eflags::VIF.bits()
    | Eflags::VIP.bits()
    | Eflags::ID.bits();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Dispatch,
    LoadTarget,
    SwitchStack,
    PushFrame,
    Committed,
}

#[derive(Debug)]
struct Transfer {
    kind: &'static str,
    stage: Stage,
}

impl Transfer {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            stage: Stage::Dispatch,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "{:?} after {:?}", next, self.stage);
        tracing::trace!(transfer = self.kind, from = ?self.stage, to = ?next, "far transfer");
        self.stage = next;
    }
}

/// A stack pointer staged apart from SS:ESP.
#[derive(Debug, Clone, Copy)]
struct StackCursor {
    seg: SegmentCache,
    esp: u32,
    ctx: AccessContext,
    /// Error code of a #SS raised by an access through this cursor.
    fault_code: u16,
}

impl StackCursor {
    #[inline]
    fn mask(&self) -> u32 {
        if self.seg.is_big() {
            u32::MAX
        } else {
            0xffff
        }
    }

    #[inline]
    fn sp(&self) -> u32 {
        self.esp & self.mask()
    }

    #[inline]
    fn set_sp(&mut self, sp: u32) {
        let mask = self.mask();
        self.esp = (self.esp & !mask) | (sp & mask);
    }

    #[inline]
    fn release(&mut self, bytes: u32) {
        self.set_sp(self.sp().wrapping_add(bytes));
    }
}

#[inline]
fn width(wide: bool) -> u32 {
    if wide {
        4
    } else {
        2
    }
}

impl CpuContext {
    fn current_stack(&self) -> StackCursor {
        StackCursor {
            seg: *self.segment(SegReg::Ss),
            esp: self.gpr(Gpr::Esp),
            ctx: self.access_context(),
            fault_code: 0,
        }
    }

    fn commit_stack(&mut self, stack: &StackCursor) {
        self.set_segment(SegReg::Ss, stack.seg);
        self.set_gpr(Gpr::Esp, stack.esp);
    }

    fn stack_slot(&mut self, stack: &StackCursor, sp: u32, size: u32) -> Result<u32, Fault> {
        if !stack.seg.contains(sp, size) {
            return Err(self.ss(stack.fault_code));
        }
        Ok(stack.seg.base.wrapping_add(sp))
    }

    fn push(
        &mut self,
        bus: &mut impl MemoryBus,
        stack: &mut StackCursor,
        value: u32,
        wide: bool,
    ) -> Result<(), Fault> {
        let size = width(wide);
        let sp = stack.sp().wrapping_sub(size) & stack.mask();
        let linear = self.stack_slot(stack, sp, size)?;
        let written = if wide {
            self.mmu.write_linear_u32(bus, linear, value, stack.ctx)
        } else {
            self.mmu
                .write_linear_u16(bus, linear, value as u16, stack.ctx)
        };
        written.map_err(|pf| self.raise(pf.into()))?;
        stack.set_sp(sp);
        Ok(())
    }

    /// Read the stack slot `offset` bytes above the cursor without popping it.
    fn peek(
        &mut self,
        bus: &mut impl MemoryBus,
        stack: &StackCursor,
        offset: u32,
        wide: bool,
    ) -> Result<u32, Fault> {
        let size = width(wide);
        let sp = stack.sp().wrapping_add(offset) & stack.mask();
        let linear = self.stack_slot(stack, sp, size)?;
        let read = if wide {
            self.mmu.read_linear_u32(bus, linear, stack.ctx)
        } else {
            self.mmu
                .read_linear_u16(bus, linear, stack.ctx)
                .map(u32::from)
        };
        read.map_err(|pf| self.raise(pf.into()))
    }

    fn pop(
        &mut self,
        bus: &mut impl MemoryBus,
        stack: &mut StackCursor,
        wide: bool,
    ) -> Result<u32, Fault> {
        let value = self.peek(bus, stack, 0, wide)?;
        stack.release(width(wide));
        Ok(value)
    }

    fn check_target_limit(&mut self, desc: &Descriptor, offset: u32) -> Result<(), Fault> {
        if offset > desc.limit(self.config().class) {
            return Err(self.gp(0));
        }
        Ok(())
    }

    /// Far JMP or CALL to `selector:offset`. `return_eip` is the offset of the
    /// next instruction, pushed by calls and saved by task switches.
    pub fn load_code_segment_far(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        offset: u32,
        return_eip: u32,
        kind: FarKind,
    ) -> Result<(), Fault> {
        if self.mode() != CpuMode::Protected {
            return self.far_transfer_real(bus, selector, offset, return_eip, kind);
        }

        let mut transfer = Transfer::new("far");
        if selector & !3 == 0 {
            return Err(self.gp(0));
        }
        let code = selector & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        let cpl = self.cpl();
        let rpl = (selector & 3) as u8;

        match desc.kind() {
            DescriptorKind::Code { .. } => {
                transfer.advance(Stage::LoadTarget);
                self.check_code_privilege(&desc, selector, cpl, |cpu| cpu.gp(code))?;
                if !desc.is_present() {
                    return Err(self.np(code));
                }
                self.check_target_limit(&desc, offset)?;

                let mut stack = self.current_stack();
                if let FarKind::Call { op32 } = kind {
                    transfer.advance(Stage::PushFrame);
                    let old_cs = self.selector(SegReg::Cs);
                    self.push(bus, &mut stack, old_cs as u32, op32)?;
                    self.push(bus, &mut stack, return_eip, op32)?;
                }
                self.mark_accessed(bus, addr, &mut desc)?;

                transfer.advance(Stage::Committed);
                self.commit_code_segment(selector, &desc, cpl);
                self.commit_stack(&stack);
                self.eip = offset;
                Ok(())
            }
            DescriptorKind::CallGate16(gate) => {
                self.through_call_gate(bus, transfer, selector, &desc, gate, false, return_eip, kind)
            }
            DescriptorKind::CallGate32(gate) => {
                self.through_call_gate(bus, transfer, selector, &desc, gate, true, return_eip, kind)
            }
            DescriptorKind::TaskGate(gate) => {
                if gate.dpl < cpl.max(rpl) {
                    return Err(self.gp(code));
                }
                if !desc.is_present() {
                    return Err(self.np(code));
                }
                self.enter_task_gate(bus, gate.selector, kind.task_switch_reason(), return_eip)
            }
            DescriptorKind::AvailableTss16 | DescriptorKind::AvailableTss32 => {
                if desc.dpl() < cpl.max(rpl) {
                    return Err(self.gp(code));
                }
                if !desc.is_present() {
                    return Err(self.np(code));
                }
                self.switch_task(bus, selector, desc, kind.task_switch_reason(), return_eip)
            }
            _ => Err(self.gp(code)),
        }
    }

    fn far_transfer_real(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        offset: u32,
        return_eip: u32,
        kind: FarKind,
    ) -> Result<(), Fault> {
        let mut stack = self.current_stack();
        if let FarKind::Call { op32 } = kind {
            let old_cs = self.selector(SegReg::Cs);
            self.push(bus, &mut stack, old_cs as u32, op32)?;
            self.push(bus, &mut stack, return_eip, op32)?;
        }
        self.commit_stack(&stack);
        self.load_code_segment(bus, selector)?;
        self.eip = offset;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn through_call_gate(
        &mut self,
        bus: &mut impl MemoryBus,
        mut transfer: Transfer,
        gate_selector: u16,
        gate_desc: &Descriptor,
        gate: Gate,
        gate32: bool,
        return_eip: u32,
        kind: FarKind,
    ) -> Result<(), Fault> {
        let cpl = self.cpl();
        let gate_code = gate_selector & !3;
        if gate.dpl < cpl.max((gate_selector & 3) as u8) {
            return Err(self.gp(gate_code));
        }
        if !gate_desc.is_present() {
            return Err(self.np(gate_code));
        }

        transfer.advance(Stage::LoadTarget);
        let target = gate.selector;
        if target & !3 == 0 {
            return Err(self.gp(0));
        }
        let code = target & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, target, |cpu| cpu.gp(code))?;
        if !desc.is_code() || desc.dpl() > cpl {
            return Err(self.gp(code));
        }
        if !desc.is_present() {
            return Err(self.np(code));
        }
        self.check_target_limit(&desc, gate.offset)?;

        let conforming = desc.is_conforming_code();
        let inner = !conforming && desc.dpl() < cpl;
        let new_cpl = if inner { desc.dpl() } else { cpl };
        let mut stack = self.current_stack();

        match kind {
            // A jump through a call gate never changes privilege.
            FarKind::Jmp => {
                if !conforming && desc.dpl() != cpl {
                    return Err(self.gp(code));
                }
            }
            FarKind::Call { .. } => {
                if inner {
                    transfer.advance(Stage::SwitchStack);
                    let old = stack;
                    stack = self.inner_stack(bus, new_cpl, false)?;
                    self.push(bus, &mut stack, old.seg.selector as u32, gate32)?;
                    self.push(bus, &mut stack, old.esp, gate32)?;
                    let size = width(gate32);
                    for i in (0..gate.param_count as u32).rev() {
                        let param = self.peek(bus, &old, i * size, gate32)?;
                        self.push(bus, &mut stack, param, gate32)?;
                    }
                }
                transfer.advance(Stage::PushFrame);
                let old_cs = self.selector(SegReg::Cs);
                self.push(bus, &mut stack, old_cs as u32, gate32)?;
                self.push(bus, &mut stack, return_eip, gate32)?;
            }
        }
        self.mark_accessed(bus, addr, &mut desc)?;

        transfer.advance(Stage::Committed);
        self.commit_code_segment(target, &desc, new_cpl);
        self.commit_stack(&stack);
        self.eip = gate.offset;
        tracing::trace!(gate = gate_selector, target, new_cpl, "call gate");
        Ok(())
    }

    /// Stack for entering ring `dpl`, read from the current TSS and validated.
    fn inner_stack(
        &mut self,
        bus: &mut impl MemoryBus,
        dpl: u8,
        from_idt: bool,
    ) -> Result<StackCursor, Fault> {
        let tr = self.tr;
        let (ss_selector, esp) = if tr.is_tss32() {
            let off = 4 + dpl as u32 * 8;
            if off + 5 > tr.limit {
                return Err(self.ts(tr.selector & !3));
            }
            let esp = self.sys_read_u32(bus, tr.base.wrapping_add(off))?;
            let ss = self.sys_read_u16(bus, tr.base.wrapping_add(off + 4))?;
            (ss, esp)
        } else {
            let off = 2 + dpl as u32 * 4;
            if off + 3 > tr.limit {
                return Err(self.ts(tr.selector & !3));
            }
            let sp = self.sys_read_u16(bus, tr.base.wrapping_add(off))?;
            let ss = self.sys_read_u16(bus, tr.base.wrapping_add(off + 2))?;
            (ss, sp as u32)
        };

        if ss_selector & !3 == 0 {
            return Err(self.ts(0));
        }
        let code = ss_selector & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, ss_selector, |cpu| cpu.ts(code))?;
        if (ss_selector & 3) as u8 != dpl || desc.dpl() != dpl || !desc.is_writable_data() {
            return Err(self.ts(code));
        }
        if !desc.is_present() {
            return Err(if from_idt {
                self.np(code)
            } else {
                self.ss(code)
            });
        }
        self.mark_accessed(bus, addr, &mut desc)?;

        let class = self.config().class;
        Ok(StackCursor {
            seg: SegmentCache::from_descriptor(ss_selector, &desc, class),
            esp,
            ctx: AccessContext::with_cpl(dpl),
            fault_code: code,
        })
    }

    fn enter_task_gate(
        &mut self,
        bus: &mut impl MemoryBus,
        tss_selector: u16,
        reason: TaskSwitchReason,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let code = tss_selector & !3;
        let (_, desc) = self.fetch_gdt_descriptor(bus, tss_selector, |cpu| cpu.gp(code))?;
        if !matches!(
            desc.kind(),
            DescriptorKind::AvailableTss16 | DescriptorKind::AvailableTss32
        ) {
            return Err(self.gp(code));
        }
        if !desc.is_present() {
            return Err(self.np(code));
        }
        self.switch_task(bus, tss_selector, desc, reason, return_eip)
    }

    /// Deliver interrupt `vector`. `return_eip` is pushed as the return
    /// address: the next instruction for INT n, the current one for faults.
    pub fn interrupt(
        &mut self,
        bus: &mut impl MemoryBus,
        vector: u8,
        source: InterruptSource,
        return_eip: u32,
    ) -> Result<(), Fault> {
        self.dispatch_vector(bus, vector, source, None, return_eip)
    }

    pub(crate) fn dispatch_vector(
        &mut self,
        bus: &mut impl MemoryBus,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u32>,
        return_eip: u32,
    ) -> Result<(), Fault> {
        match self.mode() {
            CpuMode::Real => self.real_mode_interrupt(bus, vector, return_eip),
            CpuMode::Vm86 if source == InterruptSource::Software && self.eflags.iopl() != 3 => {
                Err(self.gp(0))
            }
            _ => self.protected_interrupt(bus, vector, source, error_code, return_eip),
        }
    }

    fn real_mode_interrupt(
        &mut self,
        bus: &mut impl MemoryBus,
        vector: u8,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let entry = vector as u32 * 4;
        if entry + 3 > self.idtr.limit {
            return Err(self.gp(0));
        }
        let base = self.idtr.base;
        let offset = self.sys_read_u16(bus, base.wrapping_add(entry))?;
        let segment = self.sys_read_u16(bus, base.wrapping_add(entry + 2))?;

        let flags = self.eflags.bits();
        let old_cs = self.selector(SegReg::Cs);
        let mut stack = self.current_stack();
        self.push(bus, &mut stack, flags, false)?;
        self.push(bus, &mut stack, old_cs as u32, false)?;
        self.push(bus, &mut stack, return_eip, false)?;

        self.commit_stack(&stack);
        self.segment_mut(SegReg::Cs).load_real(segment);
        self.eip = offset as u32;
        self.eflags.remove(Eflags::IF | Eflags::TF | Eflags::AC);
        Ok(())
    }

    fn protected_interrupt(
        &mut self,
        bus: &mut impl MemoryBus,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u32>,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let mut transfer = Transfer::new("interrupt");
        let ext = source.ext();
        let idt_code = vector as u16 * 8 + 2 + ext;
        let Some(gate_addr) = self.idtr.entry(vector as u32 * 8) else {
            return Err(match vector {
                8 | 13 => self.raise(Fault::DoubleFault),
                _ => self.gp(idt_code),
            });
        };
        let desc = Descriptor::from_raw(self.sys_read_u64(bus, gate_addr)?);
        let cpl = self.cpl();

        let (gate, gate32, trap) = match desc.kind() {
            DescriptorKind::InterruptGate16(gate) => (gate, false, false),
            DescriptorKind::InterruptGate32(gate) => (gate, true, false),
            DescriptorKind::TrapGate16(gate) => (gate, false, true),
            DescriptorKind::TrapGate32(gate) => (gate, true, true),
            DescriptorKind::TaskGate(gate) => {
                if source == InterruptSource::Software && gate.dpl < cpl {
                    return Err(self.gp(idt_code));
                }
                if !desc.is_present() {
                    return Err(self.np(idt_code));
                }
                self.enter_task_gate(bus, gate.selector, TaskSwitchReason::Int, return_eip)?;
                if let Some(code) = error_code {
                    let wide = self.tr.is_tss32();
                    let mut stack = self.current_stack();
                    self.push(bus, &mut stack, code, wide)?;
                    self.commit_stack(&stack);
                }
                return Ok(());
            }
            _ => return Err(self.gp(idt_code)),
        };
        if source == InterruptSource::Software && gate.dpl < cpl {
            return Err(self.gp(idt_code));
        }
        if !desc.is_present() {
            return Err(self.np(idt_code));
        }

        transfer.advance(Stage::LoadTarget);
        let target = gate.selector;
        if target & !3 == 0 {
            return Err(self.gp(ext));
        }
        let code = (target & !3) | ext;
        let (addr, mut cs_desc) = self.fetch_descriptor(bus, target, |cpu| cpu.gp(code))?;
        if !cs_desc.is_code() || cs_desc.dpl() > cpl {
            return Err(self.gp(code));
        }
        if !cs_desc.is_present() {
            return Err(self.np(code));
        }
        self.check_target_limit(&cs_desc, gate.offset)?;

        let from_v86 = self.mode() == CpuMode::Vm86;
        let inner = !cs_desc.is_conforming_code() && cs_desc.dpl() < cpl;
        if from_v86 && !(inner && cs_desc.dpl() == 0) {
            return Err(self.gp(code));
        }
        let new_cpl = if inner { cs_desc.dpl() } else { cpl };

        let flags = self.eflags.bits();
        let old_cs = self.selector(SegReg::Cs);
        let mut stack = self.current_stack();
        if inner {
            transfer.advance(Stage::SwitchStack);
            let old = stack;
            stack = self.inner_stack(bus, new_cpl, true)?;
            if from_v86 {
                for reg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    let selector = self.selector(reg);
                    self.push(bus, &mut stack, selector as u32, gate32)?;
                }
            }
            self.push(bus, &mut stack, old.seg.selector as u32, gate32)?;
            self.push(bus, &mut stack, old.esp, gate32)?;
        }

        transfer.advance(Stage::PushFrame);
        self.push(bus, &mut stack, flags, gate32)?;
        self.push(bus, &mut stack, old_cs as u32, gate32)?;
        self.push(bus, &mut stack, return_eip, gate32)?;
        if let Some(code) = error_code {
            self.push(bus, &mut stack, code, gate32)?;
        }
        self.mark_accessed(bus, addr, &mut cs_desc)?;

        transfer.advance(Stage::Committed);
        self.commit_code_segment(target, &cs_desc, new_cpl);
        self.commit_stack(&stack);
        if from_v86 {
            for reg in SegReg::DATA {
                self.set_segment(reg, SegmentCache::unusable());
            }
        }
        self.eip = gate.offset;
        let mut cleared = Eflags::TF | Eflags::NT | Eflags::VM | Eflags::RF;
        if !trap {
            cleared |= Eflags::IF;
        }
        self.eflags.remove(cleared);
        tracing::trace!(vector, ?source, ?error_code, new_cpl, "interrupt dispatched");
        Ok(())
    }

    /// Validate the CS popped by a far return or IRET. Returns the table
    /// address and descriptor; the new CPL is the selector's RPL.
    fn return_code_segment(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
    ) -> Result<(u32, Descriptor), Fault> {
        if selector & !3 == 0 {
            return Err(self.gp(0));
        }
        let code = selector & !3;
        let (addr, desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        let rpl = (selector & 3) as u8;
        if rpl < self.cpl() {
            return Err(self.gp(code));
        }
        let ok = match desc.kind() {
            DescriptorKind::Code {
                conforming: true, ..
            } => desc.dpl() <= rpl,
            DescriptorKind::Code {
                conforming: false, ..
            } => desc.dpl() == rpl,
            _ => false,
        };
        if !ok {
            return Err(self.gp(code));
        }
        if !desc.is_present() {
            return Err(self.np(code));
        }
        Ok((addr, desc))
    }

    /// Validate the SS popped by a return to outer ring `rpl`.
    fn outer_stack(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        esp: u32,
        rpl: u8,
    ) -> Result<StackCursor, Fault> {
        if selector & !3 == 0 {
            return Err(self.gp(0));
        }
        let code = selector & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        if (selector & 3) as u8 != rpl || desc.dpl() != rpl || !desc.is_writable_data() {
            return Err(self.gp(code));
        }
        if !desc.is_present() {
            return Err(self.ss(code));
        }
        self.mark_accessed(bus, addr, &mut desc)?;

        let class = self.config().class;
        Ok(StackCursor {
            seg: SegmentCache::from_descriptor(selector, &desc, class),
            esp,
            ctx: AccessContext::with_cpl(rpl),
            fault_code: code,
        })
    }

    /// Far RET, releasing `imm` bytes of parameters from the stack (both
    /// stacks on a return to an outer ring).
    pub fn far_return(
        &mut self,
        bus: &mut impl MemoryBus,
        op32: bool,
        imm: u16,
    ) -> Result<(), Fault> {
        let mut transfer = Transfer::new("retf");
        let mut stack = self.current_stack();
        let new_eip = self.pop(bus, &mut stack, op32)?;
        let new_cs = self.pop(bus, &mut stack, op32)? as u16;
        stack.release(imm as u32);

        if self.mode() != CpuMode::Protected {
            self.load_code_segment(bus, new_cs)?;
            self.commit_stack(&stack);
            self.eip = new_eip;
            return Ok(());
        }

        transfer.advance(Stage::LoadTarget);
        let (addr, mut desc) = self.return_code_segment(bus, new_cs)?;
        let rpl = (new_cs & 3) as u8;

        if rpl == self.cpl() {
            self.check_target_limit(&desc, new_eip)?;
            self.mark_accessed(bus, addr, &mut desc)?;
            transfer.advance(Stage::Committed);
            self.commit_code_segment(new_cs, &desc, rpl);
            self.commit_stack(&stack);
            self.eip = new_eip;
            return Ok(());
        }

        transfer.advance(Stage::SwitchStack);
        let new_esp = self.pop(bus, &mut stack, op32)?;
        let new_ss = self.pop(bus, &mut stack, op32)? as u16;
        let mut outer = self.outer_stack(bus, new_ss, new_esp, rpl)?;
        outer.release(imm as u32);
        self.check_target_limit(&desc, new_eip)?;
        self.mark_accessed(bus, addr, &mut desc)?;

        transfer.advance(Stage::Committed);
        self.commit_code_segment(new_cs, &desc, rpl);
        self.commit_stack(&outer);
        self.eip = new_eip;
        self.null_inaccessible_data_segments();
        Ok(())
    }

    /// IRET. `return_eip` is only used when NT is set, to save the outgoing
    /// task's EIP.
    pub fn iret(
        &mut self,
        bus: &mut impl MemoryBus,
        op32: bool,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let upper = if op32 { IRET_UPPER } else { 0 };
        match self.mode() {
            CpuMode::Real => self.iret_real(bus, op32, FLAGS_LOW_WRITABLE | upper),
            CpuMode::Vm86 => {
                if self.eflags.iopl() != 3 {
                    return Err(self.gp(0));
                }
                let kept = Eflags::IOPL | Eflags::VIF | Eflags::VIP;
                let mask = (FLAGS_LOW_WRITABLE | upper) & !kept.bits();
                self.iret_real(bus, op32, mask)
            }
            CpuMode::Protected => self.iret_protected(bus, op32, return_eip),
        }
    }

    fn iret_real(&mut self, bus: &mut impl MemoryBus, op32: bool, mask: u32) -> Result<(), Fault> {
        let mut stack = self.current_stack();
        let new_eip = self.pop(bus, &mut stack, op32)?;
        let new_cs = self.pop(bus, &mut stack, op32)? as u16;
        let new_flags = self.pop(bus, &mut stack, op32)?;

        self.load_code_segment(bus, new_cs)?;
        self.commit_stack(&stack);
        self.eip = new_eip;
        self.load_flags(new_flags, mask);
        Ok(())
    }

    fn iret_protected(
        &mut self,
        bus: &mut impl MemoryBus,
        op32: bool,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let mut transfer = Transfer::new("iret");

        if self.eflags.contains(Eflags::NT) {
            let backlink = self.sys_read_u16(bus, self.tr.base)?;
            let code = backlink & !3;
            let (_, desc) = self.fetch_gdt_descriptor(bus, backlink, |cpu| cpu.ts(code))?;
            if !matches!(
                desc.kind(),
                DescriptorKind::BusyTss16 | DescriptorKind::BusyTss32
            ) {
                return Err(self.ts(code));
            }
            if !desc.is_present() {
                return Err(self.np(code));
            }
            return self.switch_task(bus, backlink, desc, TaskSwitchReason::Iret, return_eip);
        }

        let cpl = self.cpl();
        let mut stack = self.current_stack();
        let new_eip = self.pop(bus, &mut stack, op32)?;
        let new_cs = self.pop(bus, &mut stack, op32)? as u16;
        let new_flags = self.pop(bus, &mut stack, op32)?;

        if op32 && new_flags & Eflags::VM.bits() != 0 && cpl == 0 {
            transfer.advance(Stage::SwitchStack);
            let new_esp = self.pop(bus, &mut stack, true)?;
            let mut selectors = [0u16; 5];
            for slot in selectors.iter_mut() {
                *slot = self.pop(bus, &mut stack, true)? as u16;
            }
            let [ss, es, ds, fs, gs] = selectors;

            transfer.advance(Stage::Committed);
            self.load_flags(
                new_flags,
                FLAGS_LOW_WRITABLE | IRET_UPPER | Eflags::VM.bits(),
            );
            for (reg, selector) in [
                (SegReg::Cs, new_cs),
                (SegReg::Ss, ss),
                (SegReg::Es, es),
                (SegReg::Ds, ds),
                (SegReg::Fs, fs),
                (SegReg::Gs, gs),
            ] {
                self.set_segment(reg, SegmentCache::v86(selector));
            }
            self.set_gpr(Gpr::Esp, new_esp);
            self.eip = new_eip & 0xffff;
            self.note_privilege_change(0, 3);
            tracing::trace!(cs = new_cs, eip = self.eip, "iret to virtual-8086 mode");
            return Ok(());
        }

        transfer.advance(Stage::LoadTarget);
        let (addr, mut desc) = self.return_code_segment(bus, new_cs)?;
        let rpl = (new_cs & 3) as u8;

        let mut mask = FLAGS_LOW_WRITABLE;
        if op32 {
            mask |= IRET_UPPER;
        }
        if cpl != 0 {
            mask &= !Eflags::IOPL.bits();
        }
        if cpl > self.eflags.iopl() {
            mask &= !Eflags::IF.bits();
        }

        if rpl == cpl {
            self.check_target_limit(&desc, new_eip)?;
            self.mark_accessed(bus, addr, &mut desc)?;
            transfer.advance(Stage::Committed);
            self.commit_code_segment(new_cs, &desc, rpl);
            self.commit_stack(&stack);
            self.eip = new_eip;
            self.load_flags(new_flags, mask);
            return Ok(());
        }

        transfer.advance(Stage::SwitchStack);
        let new_esp = self.pop(bus, &mut stack, op32)?;
        let new_ss = self.pop(bus, &mut stack, op32)? as u16;
        let outer = self.outer_stack(bus, new_ss, new_esp, rpl)?;
        self.check_target_limit(&desc, new_eip)?;
        self.mark_accessed(bus, addr, &mut desc)?;

        transfer.advance(Stage::Committed);
        self.commit_code_segment(new_cs, &desc, rpl);
        self.commit_stack(&outer);
        self.eip = new_eip;
        self.load_flags(new_flags, mask);
        self.null_inaccessible_data_segments();
        Ok(())
    }
}
