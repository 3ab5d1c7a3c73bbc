//! The execution engine.
//!
//! [`Core`] is the state devices are allowed to touch: the register file,
//! memory, the output sink, and the fault/power latches. [`Machine`] owns a
//! core, the device table, the response bus, and the worker runtime, and
//! runs the fetch–decode–dispatch loop.
//!
//! Every iteration, in order: a pending fault is redirected to its handler
//! (or terminates the run), else one pending device response is delivered,
//! else the next instruction is fetched and executed. Faults raised inside
//! an instruction never unwind the loop; they set the pending latch and are
//! resolved at the top of the next iteration, which is what gives the
//! program's own handlers their chance to run.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::runtime::Runtime;

use crate::machine::assembler::{DebugSymbols, Program};
use crate::machine::devices::bus::{Response, ResponseBus};
use crate::machine::devices::console::ConsoleIo;
use crate::machine::devices::mmu::MemoryManagement;
use crate::machine::devices::power::{PowerController, PowerRequest};
use crate::machine::devices::timer::SystemTimer;
use crate::machine::devices::{
    Device, DeviceBase, InteractionId, NoDevice, Status, CMD_INFO, CMD_STATUS, MMU_PORT, NUM_PORTS,
};
use crate::machine::errors::{Fault, VmError};
use crate::machine::instruction::{Instruction, INSTRUCTION_BYTES};
use crate::machine::isa::Opcode;
use crate::machine::memory::{Memory, IVT_BYTES, IVT_PUBLIC_BASE, RESERVED_BYTES, WORD_BYTES};
use crate::{info, warn};

/// Number of general registers.
pub const NUM_REGISTERS: u16 = 32;
/// Number of special registers, indexed after the general file.
pub const NUM_SPECIAL_REGISTERS: u16 = 8;

const TOTAL_REGISTERS: usize = (NUM_REGISTERS + NUM_SPECIAL_REGISTERS) as usize;

/// Register 0: program counter.
pub const REG_PC: usize = 0;
/// Register 1: stack pointer.
pub const REG_SP: usize = 1;
/// Register 2: frame pointer.
pub const REG_FP: usize = 2;
/// Special register 32: privilege mode (0 privileged, 1 unprivileged).
pub const SR_MODE: usize = 32;
/// Special register 33: heap base installed at startup.
pub const SR_HEAP_BASE: usize = 33;

/// IVT refresh command the engine sends to the MMU on mode changes.
const MMU_CMD_REFRESH: u32 = 3;

/// An in-memory output sink, used in debug mode and by tests.
#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Engine state shared with devices during a `try_send`.
///
/// Devices never see the device table or the bus consumer; the register
/// file, memory image, and IVT are owned here and only ever mutated on the
/// engine thread.
pub struct Core {
    pub(crate) registers: [u32; TOTAL_REGISTERS],
    pub memory: Memory,
    stdout: Box<dyn Write + Send>,
    image_bytes: u32,
    pending_fault: Option<Fault>,
    errcode: Option<VmError>,
    power_request: Option<PowerRequest>,
}

impl Core {
    fn new(memory: Memory, image_bytes: u32, stdout: Box<dyn Write + Send>) -> Self {
        let mut core = Self {
            registers: [0; TOTAL_REGISTERS],
            memory,
            stdout,
            image_bytes,
            pending_fault: None,
            errcode: None,
            power_request: None,
        };
        core.set_initial_state();
        core
    }

    /// Resets registers, the IVT, the active segment, and the boot stack.
    /// Called by the factory and again on every power-cycle restart.
    fn set_initial_state(&mut self) {
        self.registers = [0; TOTAL_REGISTERS];
        self.pending_fault = None;
        self.errcode = None;
        self.power_request = None;

        self.memory.reset_window();
        self.memory.clear_ivt();

        let top = self.memory.len();
        // Boot arguments: image byte count pushed first, then the image
        // base, so the program entry sees (reserved_base, image_bytes).
        self.memory.write_image(top - WORD_BYTES, &self.image_bytes.to_le_bytes());
        self.memory
            .write_image(top - 2 * WORD_BYTES, &RESERVED_BYTES.to_le_bytes());

        self.registers[REG_PC] = RESERVED_BYTES;
        self.registers[REG_SP] = top - 2 * WORD_BYTES;
        self.registers[REG_FP] = self.registers[REG_SP];
        self.registers[SR_HEAP_BASE] = RESERVED_BYTES + self.image_bytes;
    }

    /// Current privilege mode: 0 privileged, anything else unprivileged.
    pub fn mode(&self) -> u32 {
        self.registers[SR_MODE]
    }

    /// Latches a fault for the next iteration boundary.
    pub fn raise(&mut self, fault: Fault) {
        // The first fault wins; recovery happens before new ones can land.
        if self.pending_fault.is_none() {
            self.pending_fault = Some(fault);
        }
    }

    /// Latches a power action for the engine to apply.
    pub fn request_power(&mut self, request: PowerRequest) {
        self.power_request = Some(request);
    }

    /// Writes one code point to the program's output and flushes.
    pub fn output_rune(&mut self, rune: char) {
        let mut buf = [0u8; 4];
        let _ = self.stdout.write_all(rune.encode_utf8(&mut buf).as_bytes());
        let _ = self.stdout.flush();
    }

    /// Writes raw bytes to the program's output and flushes.
    pub fn output_bytes(&mut self, bytes: &[u8]) {
        let _ = self.stdout.write_all(bytes);
        let _ = self.stdout.flush();
    }

    fn reg(&self, idx: u16) -> Result<u32, Fault> {
        self.registers
            .get(idx as usize)
            .copied()
            .ok_or(Fault::Segmentation)
    }

    fn set_reg(&mut self, idx: u16, value: u32) -> Result<(), Fault> {
        match self.registers.get_mut(idx as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Fault::Segmentation),
        }
    }

    // Stack access. The stack grows toward address zero: pushes move the
    // stack pointer down, pops move it back up.

    fn push_word(&mut self, value: u32) -> Result<(), Fault> {
        let sp = self.registers[REG_SP]
            .checked_sub(WORD_BYTES)
            .ok_or(Fault::Segmentation)?;
        self.memory.store(sp, WORD_BYTES, value)?;
        self.registers[REG_SP] = sp;
        Ok(())
    }

    fn push_byte(&mut self, value: u32) -> Result<(), Fault> {
        let sp = self.registers[REG_SP]
            .checked_sub(1)
            .ok_or(Fault::Segmentation)?;
        self.memory.store(sp, 1, value)?;
        self.registers[REG_SP] = sp;
        Ok(())
    }

    /// Copies a block below the current top, preserving byte order.
    fn push_block(&mut self, data: &[u8]) -> Result<(), Fault> {
        let sp = self.registers[REG_SP]
            .checked_sub(data.len() as u32)
            .ok_or(Fault::Segmentation)?;
        self.memory.write_slice(sp, data)?;
        self.registers[REG_SP] = sp;
        Ok(())
    }

    fn pop_word(&mut self) -> Result<u32, Fault> {
        let sp = self.registers[REG_SP];
        let value = self.memory.load(sp, WORD_BYTES)?;
        self.registers[REG_SP] = sp + WORD_BYTES;
        Ok(value)
    }

    /// Reads the top word without moving the stack pointer.
    pub fn peek_word(&self) -> Result<u32, Fault> {
        self.memory.load(self.registers[REG_SP], WORD_BYTES)
    }

    fn set_top(&mut self, value: u32) -> Result<(), Fault> {
        self.memory.store(self.registers[REG_SP], WORD_BYTES, value)
    }

    /// Binary stack operation: `f(stack[0], stack[1])` replaces both, or
    /// with one inline argument, `f(stack[0], k)` overwrites the top.
    fn binary_op(
        &mut self,
        instr: Instruction,
        f: impl FnOnce(u32, u32) -> Result<u32, Fault>,
    ) -> Result<(), Fault> {
        if instr.num_args() == 1 {
            let x = self.peek_word()?;
            self.set_top(f(x, instr.arg())?)
        } else {
            let x = self.pop_word()?;
            let y = self.peek_word()?;
            self.set_top(f(x, y)?)
        }
    }

    /// Register arithmetic: `reg ← f(reg, operand)`. The one-argument form
    /// takes its operand from the top of the stack and overwrites it with
    /// the result; the two-argument form uses the inline constant and
    /// pushes the result.
    fn register_arith(
        &mut self,
        instr: Instruction,
        f: impl FnOnce(u32, u32) -> Result<u32, Fault>,
    ) -> Result<(), Fault> {
        let operand = if instr.num_args() == 2 {
            instr.arg()
        } else {
            self.peek_word()?
        };
        let value = f(self.reg(instr.register())?, operand)?;
        self.set_reg(instr.register(), value)?;
        if instr.num_args() == 2 {
            self.push_word(value)
        } else {
            self.set_top(value)
        }
    }
}

fn float(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// Three-way compare yielding the unsigned encodings of -1, 0, and 1.
/// Unordered float inputs land in the greater-than branch.
fn compare<T: PartialOrd>(x: T, y: T) -> u32 {
    if x < y {
        u32::MAX
    } else if x == y {
        0
    } else {
        1
    }
}

fn int_div(x: u32, y: u32) -> Result<u32, Fault> {
    if y == 0 {
        return Err(Fault::DivisionByZero);
    }
    Ok(x / y)
}

fn int_rem_unsigned(x: u32, y: u32) -> Result<u32, Fault> {
    if y == 0 {
        return Err(Fault::DivisionByZero);
    }
    Ok(x % y)
}

fn int_rem_signed(x: u32, y: u32) -> Result<u32, Fault> {
    if y == 0 {
        return Err(Fault::DivisionByZero);
    }
    Ok((x as i32).wrapping_rem(y as i32) as u32)
}

/// The assembled program loaded into a machine with its devices.
pub struct Machine {
    pub(crate) core: Core,
    pub(crate) devices: Vec<Box<dyn Device>>,
    pub(crate) bus: ResponseBus,
    pub(crate) debug_sym: Option<DebugSymbols>,
    pub(crate) captured: Option<CapturedOutput>,
    // Device workers live on this runtime for the machine's lifetime.
    _runtime: Runtime,
}

impl Machine {
    /// Builds a machine writing program output to standard output.
    pub fn new(program: Program) -> Result<Self, VmError> {
        Self::with_output(program, Box::new(std::io::stdout()), None)
    }

    /// Builds a machine whose program output is captured in memory, for
    /// debug mode and tests.
    pub fn captured(program: Program) -> Result<(Self, CapturedOutput), VmError> {
        let output = CapturedOutput::default();
        let machine = Self::with_output(program, Box::new(output.clone()), Some(output.clone()))?;
        Ok((machine, output))
    }

    fn with_output(
        program: Program,
        stdout: Box<dyn Write + Send>,
        captured: Option<CapturedOutput>,
    ) -> Result<Self, VmError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .map_err(|e| VmError::Startup {
                reason: e.to_string(),
            })?;

        let mut memory = Memory::new();
        let mut image = Vec::with_capacity(program.instructions.len() * INSTRUCTION_BYTES as usize);
        for instr in &program.instructions {
            image.extend_from_slice(&instr.encode());
        }
        memory.write_image(RESERVED_BYTES, &image);

        let bus = ResponseBus::new(64);
        let device_base = |port: usize| DeviceBase {
            interrupt_addr: (port as u32) * WORD_BYTES,
            bus: bus.sender(),
        };

        let mut devices: Vec<Box<dyn Device>> = Vec::with_capacity(NUM_PORTS);
        devices.push(Box::new(SystemTimer::new(device_base(0), runtime.handle())));
        devices.push(Box::new(PowerController::new()));
        devices.push(Box::new(MemoryManagement::new(memory.len())));
        devices.push(Box::new(ConsoleIo::new(device_base(3))));
        while devices.len() < NUM_PORTS {
            devices.push(Box::new(NoDevice));
        }

        let core = Core::new(memory, image.len() as u32, stdout);
        info!("machine ready: {} image bytes at 0x{:04X}", image.len(), RESERVED_BYTES);

        Ok(Self {
            core,
            devices,
            bus,
            debug_sym: program.debug_sym,
            captured,
            _runtime: runtime,
        })
    }

    /// Runs the machine. With `single_step` set, executes exactly one
    /// iteration and returns `Ok` if the machine can continue. A full run
    /// always ends in an error value: [`VmError::SystemShutdown`] for a
    /// graceful poweroff, the fault's error for an unhandled exception.
    pub fn run(&mut self, single_step: bool) -> Result<(), VmError> {
        loop {
            if let Some(err) = self.core.errcode.clone() {
                return Err(err);
            }

            if let Some(fault) = self.core.pending_fault.take() {
                self.dispatch_fault(fault)?;
            } else if let Some(response) = self.bus.try_receive() {
                self.dispatch_response(response);
            } else {
                self.step();
            }

            if single_step {
                return Ok(());
            }
        }
    }

    /// Program counter value, for the debugger.
    pub fn pc(&self) -> u32 {
        self.core.registers[REG_PC]
    }

    /// Register file view, for the debugger.
    pub fn registers(&self) -> &[u32] {
        &self.core.registers
    }

    /// First address past the loaded program image.
    pub fn image_end(&self) -> u32 {
        RESERVED_BYTES + self.core.image_bytes
    }

    /// Redirects a pending fault into its handler, or ends the run.
    fn dispatch_fault(&mut self, fault: Fault) -> Result<(), VmError> {
        let slot = self.core.memory.ivt_entry(fault.ivt_addr());
        if slot == 0 {
            return Err(fault.into());
        }
        if self.enter_interrupt(slot).is_err() {
            // The entry sequence itself faulted. Re-enter once so a handler
            // can still catch the original fault, then give up.
            if self.enter_interrupt(slot).is_err() {
                return Err(fault.into());
            }
        }
        Ok(())
    }

    /// Delivers one device response: a device error becomes a pending
    /// fault, an unset handler slot drops the response, otherwise the
    /// handler is entered with the payload and (id, length) on the stack.
    fn dispatch_response(&mut self, response: Response) {
        if let Some(fault) = response.device_err {
            self.core.raise(fault);
            return;
        }

        let slot = self.core.memory.ivt_entry(response.interrupt_addr);
        if slot == 0 {
            warn!(
                "dropping device response: no handler at IVT 0x{:02X}",
                response.interrupt_addr
            );
            return;
        }

        if let Err(fault) = self.enter_interrupt(slot) {
            self.core.raise(fault);
            return;
        }
        let delivered = (|| {
            self.core.push_block(&response.data)?;
            self.core.push_word(response.data.len() as u32)?;
            self.core.push_word(response.id)
        })();
        if let Err(fault) = delivered {
            self.core.raise(fault);
        }
    }

    /// Interrupt entry: pushes the (pc, sp, fp, mode) snapshot so that the
    /// saved pc sits at the new frame pointer, re-bases the frame, and
    /// switches to privileged mode if needed.
    fn enter_interrupt(&mut self, handler: u32) -> Result<(), Fault> {
        let pc = self.core.registers[REG_PC];
        let sp = self.core.registers[REG_SP];
        let fp = self.core.registers[REG_FP];
        let mode = self.core.registers[SR_MODE];

        self.core.push_word(mode)?;
        self.core.push_word(fp)?;
        self.core.push_word(sp)?;
        self.core.push_word(pc)?;

        self.core.registers[REG_FP] = self.core.registers[REG_SP];
        self.core.registers[REG_PC] = handler;

        if mode != 0 {
            self.core.registers[SR_MODE] = 0;
            self.refresh_mmu();
        }
        Ok(())
    }

    /// Interrupt exit: discards everything the handler pushed and restores
    /// the entry snapshot verbatim.
    fn exec_resume(&mut self) -> Result<(), Fault> {
        self.core.registers[REG_SP] = self.core.registers[REG_FP];
        let pc = self.core.pop_word()?;
        let sp = self.core.pop_word()?;
        let fp = self.core.pop_word()?;
        let mode = self.core.pop_word()?;

        self.core.registers[REG_PC] = pc;
        self.core.registers[REG_FP] = fp;
        self.core.registers[REG_SP] = sp;

        if mode != self.core.registers[SR_MODE] {
            self.core.registers[SR_MODE] = mode;
            self.refresh_mmu();
        }
        Ok(())
    }

    /// Tells the MMU to re-apply the active segment for the current mode.
    fn refresh_mmu(&mut self) {
        self.devices[MMU_PORT].try_send(&mut self.core, 0, MMU_CMD_REFRESH, &[]);
    }

    /// Applies a restart or poweroff latched by the power controller.
    fn apply_power_request(&mut self) {
        match self.core.power_request.take() {
            Some(PowerRequest::Restart) => {
                info!("restart requested");
                self.core.set_initial_state();
                for device in self.devices.iter_mut() {
                    device.reset(&mut self.core);
                }
            }
            Some(PowerRequest::Poweroff) => {
                info!("poweroff requested");
                for device in self.devices.iter_mut() {
                    device.close();
                }
                self.core.errcode = Some(VmError::SystemShutdown);
            }
            None => {}
        }
    }

    /// Fetches, decodes, and executes one instruction. Faults land in the
    /// pending latch, never unwind.
    fn step(&mut self) {
        let pc = self.core.registers[REG_PC];
        let mut bytes = [0u8; INSTRUCTION_BYTES as usize];
        match self.core.memory.slice(pc, INSTRUCTION_BYTES) {
            Ok(slice) => bytes.copy_from_slice(slice),
            Err(fault) => {
                self.core.raise(fault);
                return;
            }
        }
        self.core.registers[REG_PC] = pc + INSTRUCTION_BYTES;

        let instr = Instruction::decode(bytes);
        let Some(opcode) = instr.opcode() else {
            self.core.raise(Fault::UnknownInstruction);
            return;
        };

        // A (opcode, argument-count) pair outside the assembler's closed
        // set means the program wrote garbage over its own code.
        let argc = instr.num_args();
        if argc < opcode.required_args() || argc > opcode.required_args() + opcode.optional_args() {
            self.core.raise(Fault::UnknownInstruction);
            return;
        }

        if opcode.is_privileged() && self.core.mode() != 0 {
            self.core.raise(Fault::IllegalInstruction);
            return;
        }

        if let Err(fault) = self.exec(opcode, instr) {
            self.core.raise(fault);
        }
    }

    fn exec(&mut self, opcode: Opcode, instr: Instruction) -> Result<(), Fault> {
        let core = &mut self.core;
        match opcode {
            Opcode::Nop => {}

            // Pushes.
            Opcode::Byte => core.push_byte(instr.arg())?,
            Opcode::Const => core.push_word(instr.arg())?,

            // Register file.
            Opcode::Rload => {
                let value = core.reg(instr.register())?;
                core.push_word(value)?;
            }
            Opcode::Rstore => {
                let value = core.pop_word()?;
                core.set_reg(instr.register(), value)?;
            }
            Opcode::Rkstore => {
                let value = core.peek_word()?;
                core.set_reg(instr.register(), value)?;
            }

            // Pointer loads and stores.
            Opcode::Loadp8 => Self::exec_loadp(core, instr, 1)?,
            Opcode::Loadp16 => Self::exec_loadp(core, instr, 2)?,
            Opcode::Loadp32 => Self::exec_loadp(core, instr, 4)?,
            Opcode::Storep8 => Self::exec_storep(core, instr, 1)?,
            Opcode::Storep16 => Self::exec_storep(core, instr, 2)?,
            Opcode::Storep32 => Self::exec_storep(core, instr, 4)?,

            // Stack pointer adjustment.
            Opcode::Push => Self::exec_stack_adjust(core, instr, false)?,
            Opcode::Pop => Self::exec_stack_adjust(core, instr, true)?,

            // Arithmetic.
            Opcode::Addi => core.binary_op(instr, |x, y| Ok(x.wrapping_add(y)))?,
            Opcode::Subi => core.binary_op(instr, |x, y| Ok(x.wrapping_sub(y)))?,
            Opcode::Muli => core.binary_op(instr, |x, y| Ok(x.wrapping_mul(y)))?,
            Opcode::Divi => core.binary_op(instr, int_div)?,
            Opcode::Addf => core.binary_op(instr, |x, y| Ok((float(x) + float(y)).to_bits()))?,
            Opcode::Subf => core.binary_op(instr, |x, y| Ok((float(x) - float(y)).to_bits()))?,
            Opcode::Mulf => core.binary_op(instr, |x, y| Ok((float(x) * float(y)).to_bits()))?,
            Opcode::Divf => core.binary_op(instr, |x, y| Ok((float(x) / float(y)).to_bits()))?,
            Opcode::Remu => core.binary_op(instr, int_rem_unsigned)?,
            Opcode::Rems => core.binary_op(instr, int_rem_signed)?,
            Opcode::Remf => core.binary_op(instr, |x, y| Ok((float(x) % float(y)).to_bits()))?,

            // Bitwise logic.
            Opcode::Not => {
                let value = core.peek_word()?;
                core.set_top(!value)?;
            }
            Opcode::And => core.binary_op(instr, |x, y| Ok(x & y))?,
            Opcode::Or => core.binary_op(instr, |x, y| Ok(x | y))?,
            Opcode::Xor => core.binary_op(instr, |x, y| Ok(x ^ y))?,
            Opcode::Shiftl => core.binary_op(instr, |x, y| Ok(x.checked_shl(y).unwrap_or(0)))?,
            Opcode::Shiftr => core.binary_op(instr, |x, y| Ok(x.checked_shr(y).unwrap_or(0)))?,

            // Comparisons.
            Opcode::Cmpu => core.binary_op(instr, |x, y| Ok(compare(x, y)))?,
            Opcode::Cmps => core.binary_op(instr, |x, y| Ok(compare(x as i32, y as i32)))?,
            Opcode::Cmpf => core.binary_op(instr, |x, y| Ok(compare(float(x), float(y))))?,

            // Jumps.
            Opcode::Jmp => {
                let target = if instr.num_args() == 1 {
                    instr.arg()
                } else {
                    core.pop_word()?
                };
                core.registers[REG_PC] = target;
            }
            Opcode::Jz => Self::exec_jump(core, instr, |v| v == 0)?,
            Opcode::Jnz => Self::exec_jump(core, instr, |v| v != 0)?,
            Opcode::Jle => Self::exec_jump(core, instr, |v| (v as i32) <= 0)?,
            Opcode::Jl => Self::exec_jump(core, instr, |v| (v as i32) < 0)?,
            Opcode::Jge => Self::exec_jump(core, instr, |v| (v as i32) >= 0)?,
            Opcode::Jg => Self::exec_jump(core, instr, |v| (v as i32) > 0)?,

            // Calls.
            Opcode::Call => {
                let target = if instr.num_args() == 1 {
                    instr.arg()
                } else {
                    core.pop_word()?
                };
                let pc = core.registers[REG_PC];
                let fp = core.registers[REG_FP];
                core.push_word(pc)?;
                core.push_word(fp)?;
                core.registers[REG_FP] = core.registers[REG_SP];
                core.registers[REG_PC] = target;
            }
            Opcode::Return => Self::exec_return(core, instr)?,

            // Register arithmetic.
            Opcode::Raddi => core.register_arith(instr, |r, x| Ok(r.wrapping_add(x)))?,
            Opcode::Rsubi => core.register_arith(instr, |r, x| Ok(r.wrapping_sub(x)))?,
            Opcode::Rmuli => core.register_arith(instr, |r, x| Ok(r.wrapping_mul(x)))?,
            Opcode::Rdivi => core.register_arith(instr, int_div)?,
            Opcode::Raddf => core.register_arith(instr, |r, x| Ok((float(r) + float(x)).to_bits()))?,
            Opcode::Rsubf => core.register_arith(instr, |r, x| Ok((float(r) - float(x)).to_bits()))?,
            Opcode::Rmulf => core.register_arith(instr, |r, x| Ok((float(r) * float(x)).to_bits()))?,
            Opcode::Rdivf => core.register_arith(instr, |r, x| Ok((float(r) / float(x)).to_bits()))?,
            Opcode::Rshiftl => {
                core.register_arith(instr, |r, x| Ok(r.checked_shl(x).unwrap_or(0)))?
            }
            Opcode::Rshiftr => {
                core.register_arith(instr, |r, x| Ok(r.checked_shr(x).unwrap_or(0)))?
            }

            // Interrupts.
            Opcode::Sysint => {
                let addr = instr.arg();
                if addr < IVT_PUBLIC_BASE && self.core.mode() != 0 {
                    return Err(Fault::IllegalInstruction);
                }
                if addr >= IVT_BYTES {
                    return Err(Fault::UnknownInstruction);
                }
                let slot = self.core.memory.ivt_entry(addr);
                if slot == 0 {
                    return Err(Fault::UnknownInstruction);
                }
                self.enter_interrupt(slot)?;
            }
            Opcode::Resume => self.exec_resume()?,
            Opcode::Halt => {
                // Privileged spin: block until any device response (or a
                // shutdown applied beforehand) ends the wait. The response
                // itself is consumed by the next iteration.
                self.bus.wait();
            }

            // Special registers.
            Opcode::Srload => {
                let value = core.reg(instr.register())?;
                core.push_word(value)?;
            }
            Opcode::Srstore => {
                let value = core.pop_word()?;
                core.set_reg(instr.register(), value)?;
                if instr.register() as usize == SR_MODE {
                    self.refresh_mmu();
                }
            }

            // Devices.
            Opcode::Write => self.exec_write(instr)?,
        }
        Ok(())
    }

    fn exec_loadp(core: &mut Core, instr: Instruction, count: u32) -> Result<(), Fault> {
        let offset = if instr.num_args() == 1 { instr.arg() } else { 0 };
        let addr = core.peek_word()?.wrapping_add(offset);
        let value = core.memory.load(addr, count)?;
        core.set_top(value)
    }

    fn exec_storep(core: &mut Core, instr: Instruction, count: u32) -> Result<(), Fault> {
        let offset = if instr.num_args() == 1 { instr.arg() } else { 0 };
        let addr = core.pop_word()?.wrapping_add(offset);
        let value = core.pop_word()?;
        // The exception and device slots of the IVT are sealed against
        // unprivileged writes even when the MMU window admits them.
        if core.mode() != 0 && addr < IVT_PUBLIC_BASE {
            return Err(Fault::IllegalInstruction);
        }
        core.memory.store(addr, count, value)
    }

    /// `push` reserves bytes, `pop` frees them; the count comes from the
    /// immediate or the stack. The stack pointer must stay inside the
    /// active segment.
    fn exec_stack_adjust(core: &mut Core, instr: Instruction, free: bool) -> Result<(), Fault> {
        let count = if instr.num_args() == 1 {
            instr.arg()
        } else {
            core.pop_word()?
        };
        let sp = core.registers[REG_SP];
        let new_sp = if free {
            sp.checked_add(count)
        } else {
            sp.checked_sub(count)
        }
        .ok_or(Fault::Segmentation)?;
        if !core.memory.stack_in_bounds(new_sp) {
            return Err(Fault::Segmentation);
        }
        core.registers[REG_SP] = new_sp;
        Ok(())
    }

    /// Conditional jump. Without an immediate the target is popped first,
    /// then the condition value; with one, only the condition is popped.
    fn exec_jump(core: &mut Core, instr: Instruction, taken: impl FnOnce(u32) -> bool) -> Result<(), Fault> {
        let target = if instr.num_args() == 1 {
            instr.arg()
        } else {
            core.pop_word()?
        };
        let value = core.pop_word()?;
        if taken(value) {
            core.registers[REG_PC] = target;
        }
        Ok(())
    }

    /// `return [n]`: unwinds the frame, then re-pushes the top `n` payload
    /// bytes above the restored stack pointer. Source and destination may
    /// overlap, so the copy goes through the overlap-safe memory move.
    fn exec_return(core: &mut Core, instr: Instruction) -> Result<(), Fault> {
        let payload = if instr.num_args() == 1 { instr.arg() } else { 0 };
        let payload_start = core.registers[REG_SP];

        core.registers[REG_SP] = core.registers[REG_FP];
        let fp = core.pop_word()?;
        let pc = core.pop_word()?;
        core.registers[REG_FP] = fp;
        core.registers[REG_PC] = pc;

        if payload > 0 {
            let dst = core.registers[REG_SP]
                .checked_sub(payload)
                .ok_or(Fault::Segmentation)?;
            core.memory.copy_within(payload_start, dst, payload)?;
            core.registers[REG_SP] = dst;
        }
        Ok(())
    }

    /// The `write` instruction: command 0 pushes (metadata…, length, hwid),
    /// command 1 pushes a status probe, and any other command consumes
    /// (id, byte count, source address) from the stack, hands the payload
    /// to the device, and pushes the resulting status.
    fn exec_write(&mut self, instr: Instruction) -> Result<(), Fault> {
        let port = instr.register() as usize;
        let command = instr.arg();

        if port >= self.devices.len() {
            self.core.push_word(Status::NotFound.code())?;
            return Ok(());
        }

        match command {
            CMD_INFO => {
                let info = self.devices[port].info();
                self.core.push_block(&info.metadata)?;
                self.core.push_word(info.metadata.len() as u32)?;
                self.core.push_word(info.hwid)?;
            }
            CMD_STATUS => {
                let status = self.devices[port].try_send(&mut self.core, 0, CMD_STATUS, &[]);
                self.core.push_word(status.code())?;
            }
            _ => {
                let id: InteractionId = self.core.pop_word()?;
                let count = self.core.pop_word()?;
                let addr = self.core.pop_word()?;
                let data = self.core.memory.slice(addr, count)?.to_vec();
                let status = self.devices[port].try_send(&mut self.core, id, command, &data);
                self.core.push_word(status.code())?;
                // Power actions act on the whole machine; apply them only
                // after the instruction has finished with the stack.
                self.apply_power_request();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::assembler::{assemble, assemble_source};

    /// Stack words a program needs to feed `write` commands ≥ 2 that carry
    /// no payload, plus the command itself.
    const POWEROFF: &str = "const 0\nconst 0\nconst 0\nwrite 1 3";

    fn build(source: &str) -> Machine {
        let program = assemble_source(source, false).expect("assembly failed");
        Machine::new(program).expect("machine setup failed")
    }

    fn build_captured(source: &str) -> (Machine, CapturedOutput) {
        let program = assemble_source(source, false).expect("assembly failed");
        Machine::captured(program).expect("machine setup failed")
    }

    /// Executes exactly `steps` engine iterations.
    fn exec_steps(machine: &mut Machine, steps: usize) {
        for _ in 0..steps {
            machine.run(true).expect("unexpected terminal error");
        }
    }

    fn run_to_end(source: &str) -> VmError {
        build(source).run(false).expect_err("run always ends in an outcome")
    }

    fn top(machine: &Machine) -> u32 {
        machine.core.peek_word().expect("empty stack")
    }

    fn sp(machine: &Machine) -> u32 {
        machine.core.registers[REG_SP]
    }

    // ==================== Boot state ====================

    #[test]
    fn boot_registers_and_stack() {
        let machine = build("nop\nnop");
        assert_eq!(machine.pc(), RESERVED_BYTES);
        let top_addr = machine.core.memory.len();
        assert_eq!(sp(&machine), top_addr - 8);
        assert_eq!(machine.core.registers[REG_FP], top_addr - 8);
        // Entry sees (reserved_base, image_bytes) from the top down.
        assert_eq!(top(&machine), RESERVED_BYTES);
        assert_eq!(machine.core.memory.load(top_addr - 4, 4).unwrap(), 16);
        assert_eq!(machine.core.registers[SR_MODE], 0);
        assert_eq!(machine.core.registers[SR_HEAP_BASE], RESERVED_BYTES + 16);
    }

    // ==================== Pushes and register file ====================

    #[test]
    fn const_pushes_word_and_byte_pushes_byte() {
        let mut machine = build("const 0x01020304\nbyte 0x55");
        exec_steps(&mut machine, 1);
        assert_eq!(top(&machine), 0x01020304);
        let before = sp(&machine);
        exec_steps(&mut machine, 1);
        assert_eq!(sp(&machine), before - 1);
        assert_eq!(machine.core.memory.load(sp(&machine), 1).unwrap(), 0x55);
    }

    #[test]
    fn rload_rstore_rkstore() {
        let mut machine = build("const 7\nrstore 3\nrload 3");
        exec_steps(&mut machine, 3);
        assert_eq!(top(&machine), 7);
        assert_eq!(machine.core.registers[3], 7);

        // rkstore leaves the value on the stack where rstore consumes it.
        let mut keep = build("const 9\nrkstore 4");
        exec_steps(&mut keep, 2);
        assert_eq!(top(&keep), 9);
        assert_eq!(keep.core.registers[4], 9);
    }

    #[test]
    fn rkstore_then_pop_equals_rstore() {
        let mut a = build("const 41\nrkstore 5\npop 4");
        let mut b = build("const 41\nrstore 5");
        exec_steps(&mut a, 3);
        exec_steps(&mut b, 2);
        assert_eq!(a.core.registers, b.core.registers);
    }

    // ==================== Arithmetic ====================

    /// Runs a two-value stack computation and returns the resulting top.
    fn compute(source: &str) -> u32 {
        let full = format!("{source}\n{POWEROFF}");
        let mut machine = build(&full);
        let steps = source.lines().count();
        exec_steps(&mut machine, steps);
        top(&machine)
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(compute("const 3\nconst 5\naddi"), 8);
        // Binary form computes stack[0] op stack[1].
        assert_eq!(compute("const 3\nconst 5\nsubi"), 2);
        assert_eq!(compute("const 6\nconst 7\nmuli"), 42);
        assert_eq!(compute("const 2\nconst 10\ndivi"), 5);
        assert_eq!(compute("const 3\nconst 10\nremu"), 1);
        assert_eq!(compute("const 4\nconst -10\nrems"), (-2i32) as u32);
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(compute("const 0xFFFFFFFF\nconst 1\naddi"), 0);
        assert_eq!(compute("const 1\nconst 0\nsubi"), u32::MAX);
    }

    #[test]
    fn inline_fast_paths() {
        assert_eq!(compute("const 40\naddi 2"), 42);
        assert_eq!(compute("const 40\nsubi 2"), 38);
        assert_eq!(compute("const 21\nmuli 2"), 42);
        assert_eq!(compute("const 84\ndivi 2"), 42);
        assert_eq!(compute("const 47\nremu 5"), 2);
    }

    #[test]
    fn float_arithmetic() {
        assert_eq!(compute("const 1.5\nconst 2.25\naddf"), 3.75f32.to_bits());
        // Binary form computes stack[0] op stack[1].
        assert_eq!(compute("const 2.0\nconst 3.0\nsubf"), 1.0f32.to_bits());
        assert_eq!(compute("const 2.0\nconst 8.0\ndivf"), 4.0f32.to_bits());
        assert_eq!(compute("const 0.5\nmulf 3.0"), 1.5f32.to_bits());
        assert_eq!(compute("const 2.5\nremf 2.0"), 0.5f32.to_bits());
    }

    #[test]
    fn bitwise_logic() {
        assert_eq!(compute("const 0xC\nand 0xA"), 0x8);
        assert_eq!(compute("const 0xF0\nconst 0x0F\nor"), 0xFF);
        assert_eq!(compute("const 0xFF\nxor 0x0F"), 0xF0);
        assert_eq!(compute("const 0\nnot"), u32::MAX);
        assert_eq!(compute("const 4\nconst 1\nshiftl"), 16);
        assert_eq!(compute("const 2\nconst 16\nshiftr"), 4);
        // Shifting by the full width clears, it does not wrap.
        assert_eq!(compute("const 32\nconst 1\nshiftl"), 0);
    }

    #[test]
    fn comparisons_yield_sign_words() {
        assert_eq!(compute("const 5\nconst 3\ncmpu"), u32::MAX);
        assert_eq!(compute("const 5\nconst 5\ncmpu"), 0);
        assert_eq!(compute("const 3\nconst 5\ncmpu"), 1);
        // Signed comparison: -1 < 1.
        assert_eq!(compute("const 1\nconst -1\ncmps"), u32::MAX);
        // Unsigned comparison: 0xFFFFFFFF > 1.
        assert_eq!(compute("const 1\nconst -1\ncmpu"), 1);
        assert_eq!(compute("const 2.0\nconst 1.0\ncmpf"), u32::MAX);
    }

    #[test]
    fn register_arithmetic_forms() {
        // One-argument form: operand from the stack, result overwrites it.
        let mut machine = build("const 10\nrstore 3\nconst 4\nraddi 3");
        exec_steps(&mut machine, 4);
        assert_eq!(machine.core.registers[3], 14);
        assert_eq!(top(&machine), 14);

        // Two-argument form: inline operand, result pushed.
        let mut machine = build("const 10\nrstore 3\nrsubi 3 4");
        let before = {
            exec_steps(&mut machine, 2);
            sp(&machine)
        };
        exec_steps(&mut machine, 1);
        assert_eq!(machine.core.registers[3], 6);
        assert_eq!(top(&machine), 6);
        assert_eq!(sp(&machine), before - 4);
    }

    #[test]
    fn register_shifts() {
        let mut machine = build("const 1\nrstore 3\nrshiftl 3 4\nrshiftr 3 2");
        exec_steps(&mut machine, 4);
        assert_eq!(machine.core.registers[3], 4);
    }

    // ==================== Pointer loads/stores and push/pop ====================

    #[test]
    fn storep_and_loadp_round_trip() {
        let mut machine = build(
            "const 0x12345678\nconst 0x4000\nstorep32\nconst 0x4000\nloadp16\nconst 0x4000\nloadp8 2",
        );
        exec_steps(&mut machine, 5);
        assert_eq!(top(&machine), 0x5678);
        exec_steps(&mut machine, 2);
        assert_eq!(top(&machine), 0x34);
    }

    #[test]
    fn storep_narrows() {
        let mut machine = build("const 0xAABBCCDD\nconst 0x4000\nstorep8\nconst 0x4000\nloadp32");
        exec_steps(&mut machine, 5);
        assert_eq!(top(&machine), 0xDD);
    }

    #[test]
    fn push_pop_adjust_stack_pointer() {
        let mut machine = build("push 16\npop 16\nconst 8\npush");
        let boot_sp = sp(&machine);
        exec_steps(&mut machine, 1);
        assert_eq!(sp(&machine), boot_sp - 16);
        exec_steps(&mut machine, 1);
        assert_eq!(sp(&machine), boot_sp);
        exec_steps(&mut machine, 2);
        // `const 8` then `push` with the count popped from the stack.
        assert_eq!(sp(&machine), boot_sp - 8);
    }

    // ==================== Jumps ====================

    #[test]
    fn jmp_with_immediate() {
        // The division by zero is jumped over; the program shuts down.
        let source = format!("jmp skip\nconst 0\nconst 1\ndivi\nskip:\n{POWEROFF}");
        assert_eq!(run_to_end(&source), VmError::SystemShutdown);
    }

    #[test]
    fn conditional_jump_takes_and_falls_through() {
        // Taken: jnz with nonzero condition.
        let mut machine = build("const 1\njnz target\nnop\ntarget:\nnop");
        exec_steps(&mut machine, 2);
        assert_eq!(machine.pc(), RESERVED_BYTES + 3 * 8);

        // Not taken: jz with nonzero condition falls through.
        let mut machine = build("const 1\njz target\nnop\ntarget:\nnop");
        exec_steps(&mut machine, 2);
        assert_eq!(machine.pc(), RESERVED_BYTES + 2 * 8);
    }

    #[test]
    fn signed_condition_jumps() {
        let mut machine = build("const -1\njl neg\nnop\nneg:\nnop");
        exec_steps(&mut machine, 2);
        assert_eq!(machine.pc(), RESERVED_BYTES + 3 * 8);

        let mut machine = build("const -1\njge nn\nnop\nnn:\nnop");
        exec_steps(&mut machine, 2);
        assert_eq!(machine.pc(), RESERVED_BYTES + 2 * 8);
    }

    #[test]
    fn bare_jump_pops_address_then_condition() {
        // Stack going into jz: target on top, condition value below it.
        let mut machine = build("const 0\nconst target\njz\nnop\ntarget:\nnop");
        let boot_sp = sp(&machine);
        exec_steps(&mut machine, 3);
        assert_eq!(machine.pc(), RESERVED_BYTES + 4 * 8);
        // Both words consumed.
        assert_eq!(sp(&machine), boot_sp);
    }

    // ==================== Call / return ====================

    #[test]
    fn call_and_return_restore_frame() {
        let source = "call func\nnop\nnop\nfunc:\nreturn";
        let mut machine = build(source);
        let boot_sp = sp(&machine);
        let boot_fp = machine.core.registers[REG_FP];

        exec_steps(&mut machine, 1); // call
        assert_eq!(machine.pc(), RESERVED_BYTES + 3 * 8);
        assert_eq!(machine.core.registers[REG_FP], sp(&machine));
        // Frame holds (saved fp, return pc) from the frame pointer up.
        let fp = machine.core.registers[REG_FP];
        assert_eq!(machine.core.memory.load(fp, 4).unwrap(), boot_fp);
        assert_eq!(
            machine.core.memory.load(fp + 4, 4).unwrap(),
            RESERVED_BYTES + 8
        );

        exec_steps(&mut machine, 1); // return
        assert_eq!(machine.pc(), RESERVED_BYTES + 8);
        assert_eq!(sp(&machine), boot_sp);
        assert_eq!(machine.core.registers[REG_FP], boot_fp);
    }

    #[test]
    fn call_pops_target_from_stack_when_no_immediate() {
        let mut machine = build("const func\ncall\nnop\nfunc:\nnop");
        exec_steps(&mut machine, 2);
        assert_eq!(machine.pc(), RESERVED_BYTES + 3 * 8);
    }

    #[test]
    fn return_carries_payload() {
        let source = "call func\nnop\nfunc:\nconst 99\nreturn 4";
        let mut machine = build(source);
        let boot_sp = sp(&machine);
        exec_steps(&mut machine, 3);
        assert_eq!(machine.pc(), RESERVED_BYTES + 8);
        // Four payload bytes sit above the caller's stack.
        assert_eq!(sp(&machine), boot_sp - 4);
        assert_eq!(top(&machine), 99);
    }

    // ==================== Faults ====================

    #[test]
    fn division_by_zero_without_handler_terminates() {
        assert_eq!(
            run_to_end("const 0\nconst 1\ndivi"),
            VmError::DivisionByZero
        );
        assert_eq!(run_to_end("const 0\nconst 1\nremu"), VmError::DivisionByZero);
        assert_eq!(run_to_end("const 10\nrstore 3\nrdivi 3 0"), VmError::DivisionByZero);
    }

    #[test]
    fn stack_overflow_is_a_segmentation_fault() {
        assert_eq!(
            run_to_end("loop:\nconst 5\njmp loop"),
            VmError::SegmentationFault
        );
    }

    #[test]
    fn out_of_bounds_access_is_a_segmentation_fault() {
        assert_eq!(
            run_to_end("const 0xFFFFFF00\nloadp32"),
            VmError::SegmentationFault
        );
    }

    #[test]
    fn privileged_op_in_unprivileged_mode_is_illegal() {
        // Drop privilege, then try a device write.
        assert_eq!(
            run_to_end("const 1\nsrstore 32\nwrite 0 0"),
            VmError::IllegalInstruction
        );
        assert_eq!(run_to_end("const 1\nsrstore 32\nhalt"), VmError::IllegalInstruction);
        assert_eq!(
            run_to_end("const 1\nsrstore 32\nresume"),
            VmError::IllegalInstruction
        );
    }

    #[test]
    fn overwritten_code_is_an_unknown_instruction() {
        // Write a garbage instruction word over the IVT region and jump to
        // it: opcode 0xFF with argument count 0xFF decodes to nothing.
        assert_eq!(
            run_to_end("const 0xFFFFFFFF\nconst 0x00\nstorep32\njmp 0x00"),
            VmError::UnknownInstruction
        );
    }

    #[test]
    fn fault_redirects_to_installed_handler() {
        // A segmentation-fault handler that powers the machine off turns a
        // wild load into a clean shutdown.
        let source = format!(
            "const handler\nconst 0x40\nstorep32\nconst 0xFFFFFF00\nloadp32\nhandler:\n{POWEROFF}"
        );
        assert_eq!(run_to_end(&source), VmError::SystemShutdown);
    }

    // ==================== Interrupt entry and resume ====================

    #[test]
    fn sysint_saves_snapshot_and_resume_restores_it() {
        let source = "const handler\nconst 0xA0\nstorep32\nsysint 0xA0\nnop\nhandler:\nconst 123\nresume";
        let mut machine = build(source);
        exec_steps(&mut machine, 3); // install handler

        let pc_before = machine.pc();
        let sp_before = sp(&machine);
        let fp_before = machine.core.registers[REG_FP];

        exec_steps(&mut machine, 1); // sysint
        let fp = machine.core.registers[REG_FP];
        assert_eq!(machine.pc(), RESERVED_BYTES + 5 * 8);
        assert_eq!(sp(&machine), fp);
        // Snapshot layout from the frame pointer up: pc, sp, fp, mode.
        assert_eq!(machine.core.memory.load(fp, 4).unwrap(), pc_before + 8);
        assert_eq!(machine.core.memory.load(fp + 4, 4).unwrap(), sp_before);
        assert_eq!(machine.core.memory.load(fp + 8, 4).unwrap(), fp_before);
        assert_eq!(machine.core.memory.load(fp + 12, 4).unwrap(), 0);

        exec_steps(&mut machine, 2); // handler body, resume
        assert_eq!(machine.pc(), pc_before + 8);
        assert_eq!(sp(&machine), sp_before);
        assert_eq!(machine.core.registers[REG_FP], fp_before);
    }

    #[test]
    fn sysint_to_empty_slot_is_unknown() {
        assert_eq!(run_to_end("sysint 0xA4"), VmError::UnknownInstruction);
    }

    #[test]
    fn unprivileged_sysint_below_public_range_is_illegal() {
        let source = "const 1\nsrstore 32\nsysint 0x40";
        assert_eq!(run_to_end(source), VmError::IllegalInstruction);
    }

    #[test]
    fn interrupt_entry_from_unprivileged_mode_regains_privilege() {
        // Install a public handler that powers off (a privileged act), then
        // drop privilege and invoke it.
        let source = format!(
            "const handler\nconst 0xA0\nstorep32\nconst 1\nsrstore 32\nsysint 0xA0\nhandler:\n{POWEROFF}"
        );
        assert_eq!(run_to_end(&source), VmError::SystemShutdown);
    }

    // ==================== MMU and privilege ====================

    /// Assembly that stores the 8-byte MMU payload `(min, max)` at 0x2000
    /// and installs it as the unprivileged window.
    fn install_mmu_window(min: &str, max: &str) -> String {
        format!(
            "const {min}\nconst 0x2000\nstorep32\n\
const {max}\nconst 0x2004\nstorep32\n\
const 0x2000\nconst 8\nconst 0\nwrite 2 2\npop 4"
        )
    }

    #[test]
    fn unprivileged_window_confines_access() {
        // Window covers the image and the stack; a load below it faults.
        let source = format!(
            "{}\nconst 1\nsrstore 32\nconst 0x80\nloadp32",
            install_mmu_window("0x100", "0x10000")
        );
        assert_eq!(run_to_end(&source), VmError::SegmentationFault);
    }

    #[test]
    fn unprivileged_ivt_write_is_illegal() {
        // Window admits all of memory, so only the seal stops the write.
        let source = format!(
            "{}\nconst 1\nsrstore 32\nconst 99\nconst 0x44\nstorep32",
            install_mmu_window("0", "0x10000")
        );
        assert_eq!(run_to_end(&source), VmError::IllegalInstruction);
    }

    #[test]
    fn mode_write_refreshes_active_segment() {
        let source = format!(
            "{}\nconst 1\nsrstore 32",
            install_mmu_window("0x1000", "0x8000")
        );
        let mut machine = build(&source);
        exec_steps(&mut machine, 13);
        assert_eq!(machine.core.memory.window(), (0x1000, 0x8000));
    }

    // ==================== Devices ====================

    #[test]
    fn device_info_and_status() {
        let mut machine = build("write 0 0\nwrite 5 1");
        exec_steps(&mut machine, 1);
        // Info pushes (metadata…, length, hwid); the timer has no metadata.
        assert_eq!(top(&machine), 0x01);
        exec_steps(&mut machine, 1);
        // Port 5 is empty.
        assert_eq!(top(&machine), Status::NotFound.code());
    }

    #[test]
    fn write_pushes_device_status() {
        let mut machine = build("const 0\nconst 0\nconst 0\nwrite 1 1");
        exec_steps(&mut machine, 4);
        assert_eq!(top(&machine), Status::Ready.code());
    }

    #[test]
    fn poweroff_shuts_the_machine_down() {
        assert_eq!(run_to_end(POWEROFF), VmError::SystemShutdown);
    }

    #[test]
    fn restart_reboots_with_cleared_state() {
        // First boot sets a flag in memory and restarts; second boot sees
        // the flag and powers off.
        let source = format!(
            "const 0x4000\nloadp8\njnz done\nconst 1\nconst 0x4000\nstorep8\n\
const 0\nconst 0\nconst 0\nwrite 1 2\ndone:\n{POWEROFF}"
        );
        assert_eq!(run_to_end(&source), VmError::SystemShutdown);
    }

    #[test]
    fn timer_response_drives_handler() {
        // Install the timer handler (IVT slot 0), arm a 2ms timer, halt.
        // The handler powers the machine off.
        let source = format!(
            "const handler\nconst 0x00\nstorep32\n\
const 2000\nrload 1\nconst 4\nconst 7\nwrite 0 2\npop 4\nhalt\n\
handler:\n{POWEROFF}"
        );
        let start = std::time::Instant::now();
        assert_eq!(run_to_end(&source), VmError::SystemShutdown);
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn timer_response_without_handler_is_dropped() {
        // No handler installed: the expiry response is dropped and the
        // program continues past the halt to the poweroff.
        let source = format!(
            "const 1000\nrload 1\nconst 4\nconst 7\nwrite 0 2\npop 4\nhalt\n{POWEROFF}"
        );
        assert_eq!(run_to_end(&source), VmError::SystemShutdown);
    }

    #[test]
    fn handler_receives_interaction_id_and_length() {
        // The timer posts an empty payload; the handler must see
        // (id, 0) on the stack. It stores the id where the main line can
        // assert on it... here we just check inside the handler.
        let source = "const handler\nconst 0x00\nstorep32\n\
const 500\nrload 1\nconst 4\nconst 77\nwrite 0 2\npop 4\nhalt\n\
handler:\nnop";
        let mut machine = build(source);
        // Run until the handler's nop executes (bounded loop; the timer
        // makes this finite).
        for _ in 0..100_000 {
            machine.run(true).unwrap();
            if machine.pc() == RESERVED_BYTES + 10 * 8 + 8 {
                break;
            }
        }
        assert_eq!(machine.core.pop_word().unwrap(), 77); // interaction id
        assert_eq!(machine.core.pop_word().unwrap(), 0); // payload length
    }

    // ==================== Console output ====================

    #[test]
    fn console_writes_runes_and_ranges() {
        // Push "Hi" a character at a time via command 2, then poweroff.
        let write_rune = "rload 1\nconst 4\nconst 0\nwrite 3 2\npop 4\npop 4";
        let source = format!(
            "const 'H'\n{write_rune}\nconst 'i'\n{write_rune}\n{POWEROFF}"
        );
        let (mut machine, output) = build_captured(&source);
        assert_eq!(machine.run(false).unwrap_err(), VmError::SystemShutdown);
        assert_eq!(output.contents(), "Hi");
    }

    #[test]
    fn console_write_range_reads_memory() {
        // Store "ok\n" at 0x4000, build the (count, addr) payload at
        // 0x3004, then ask the console for 3 bytes from that address.
        let source = format!(
            "const 'o'\nconst 0x4000\nstorep8\n\
const 'k'\nconst 0x4001\nstorep8\n\
const '\\n'\nconst 0x4002\nstorep8\n\
const 3\nconst 0x3004\nstorep32\n\
const 0x4000\nconst 0x3008\nstorep32\n\
const 0x3004\nconst 8\nconst 0\nwrite 3 3\npop 4\n{POWEROFF}"
        );
        let (mut machine, output) = build_captured(&source);
        assert_eq!(machine.run(false).unwrap_err(), VmError::SystemShutdown);
        assert_eq!(output.contents(), "ok\n");
    }

    // ==================== Demo programs ====================

    #[test]
    fn demo_helloworld_prints_greeting() {
        let (mut machine, output) = build_captured(include_str!("../../demos/helloworld.b"));
        assert_eq!(machine.run(false).unwrap_err(), VmError::SystemShutdown);
        assert_eq!(output.contents(), "Hello, world!\n");
    }

    #[test]
    fn demo_countdown_prints_digits() {
        let (mut machine, output) = build_captured(include_str!("../../demos/countdown.b"));
        assert_eq!(machine.run(false).unwrap_err(), VmError::SystemShutdown);
        assert_eq!(output.contents(), "9876543210\n");
    }

    #[test]
    fn demo_poweroff_shuts_down() {
        assert_eq!(
            run_to_end(include_str!("../../demos/poweroff.b")),
            VmError::SystemShutdown
        );
    }

    #[test]
    fn sources_concatenate_across_files() {
        // A support file installs a fault handler; the main file's wild
        // load then becomes a clean shutdown. The support file runs first
        // and falls through to the main file's first instruction.
        let lib = format!(
            "jmp install\nonfault:\n{POWEROFF}\ninstall:\nconst onfault\nconst 0x40\nstorep32"
        );
        let main = "const 0xFFFFFF00\nloadp32";
        let mut lines: Vec<String> = lib.lines().map(str::to_string).collect();
        lines.extend(main.lines().map(str::to_string));
        let program = assemble(&lines, false).expect("assembly failed");
        let mut machine = Machine::new(program).expect("machine setup failed");
        assert_eq!(machine.run(false).unwrap_err(), VmError::SystemShutdown);
    }
}
