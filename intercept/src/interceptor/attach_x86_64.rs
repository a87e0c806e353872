use super::FunctionContext;
use crate::code::allocator::{CodeAllocator, CodeSlice};
use crate::interceptor::invocation::MAX_STACK_ARGUMENTS;
use crate::interceptor::listener::CallListener;
use crate::types::{HookError, InvocationContext, X86_64CpuContext};
use core::ffi::c_void;
use core::mem::{offset_of, size_of};
use core::sync::atomic::AtomicBool;
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, IcedError, InstructionBlock};
use std::sync::Mutex;

// ── Wrapper frame layout ─────────────────────────────────────────────
//
// On entry the wrapper steps over the red zone, pushes RFLAGS and
// reserves FRAME_SIZE bytes:
//
// Offset              Content
// 0                   outgoing stack arguments (STACK_ARG_SLOTS x 8)
// CPU_OFF             X86_64CpuContext
// FRAME_SIZE          saved RFLAGS
// FRAME_SIZE+8        red zone (RED_ZONE bytes)
// FRAME_SIZE+8+128    return address into the caller
//
// The caller's RSP before its CALL is therefore FRAME_SIZE + 8 + RED_ZONE + 8.
// Entry RSP is 8 mod 16, and 8 + RED_ZONE + FRAME_SIZE keeps the context
// and the nested calls 16-byte aligned.

const STACK_ARG_SLOTS: i32 = MAX_STACK_ARGUMENTS as i32;
const RED_ZONE: i32 = 128;
const CPU_OFF: i32 = STACK_ARG_SLOTS * 8;
const FRAME_SIZE: i32 = (CPU_OFF + size_of::<X86_64CpuContext>() as i32 + 15) & !15;
const CALLER_SP_OFF: i32 = FRAME_SIZE + 8 + RED_ZONE + 8;

const NEAR_JMP_SIZE: usize = 5;
const FAR_JMP_SIZE: usize = 14;
/// Slabs within this distance of the target can be reached with rel32.
const NEAR_RANGE: usize = 0x7FF0_0000;
/// Longest prologue the relocator will look at.
const MAX_PROLOGUE: usize = 32;
const ENDBR64: [u8; 4] = [0xF3, 0x0F, 0x1E, 0xFA];

const fn cpu_field(offset: usize) -> i32 {
    CPU_OFF + offset as i32
}

/// Called by the wrapper before the original function.
/// Returns 1 if a listener asked to skip the original.
unsafe extern "C" fn begin_invocation(ctx: *const FunctionContext, cpu: *mut X86_64CpuContext) -> u64 {
    let ctx = &*ctx;
    let mut inv = InvocationContext {
        function: ctx.function as *mut c_void,
        cpu_context: cpu,
        skip_original: false,
    };

    for l in ctx.snapshot_listeners() {
        if let Some(cb) = l.on_enter {
            cb(&mut inv, l.user_data);
        }
    }

    inv.skip_original as u64
}

pub(super) fn is_endbr64(code: *const u8) -> bool {
    unsafe { core::ptr::read_unaligned(code as *const [u8; 4]) == ENDBR64 }
}

fn near_jump(from: u64, to: u64) -> Option<[u8; NEAR_JMP_SIZE]> {
    let rel = i32::try_from(to as i64 - (from as i64 + NEAR_JMP_SIZE as i64)).ok()?;
    let mut out = [0xE9, 0, 0, 0, 0];
    out[1..].copy_from_slice(&rel.to_le_bytes());
    Some(out)
}

/// `jmp [rip+0]` followed by the absolute target.
fn far_jump(to: u64) -> [u8; FAR_JMP_SIZE] {
    let mut out = [0xFF, 0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    out[6..].copy_from_slice(&to.to_le_bytes());
    out
}

/// Build the trampoline and wrapper for `function_address`. Nothing in the
/// target is modified.
pub(super) fn prepare(function_address: *mut c_void, listener: CallListener) -> Result<&'static FunctionContext, HookError> {
    let function = function_address as usize;
    let patch_addr = if is_endbr64(function_address as *const u8) { function + ENDBR64.len() } else { function };

    let mut alloc = CodeAllocator::default();
    let wrapper_slice = alloc.alloc_near(patch_addr as *const u8, NEAR_RANGE)?;
    let wrapper = wrapper_slice.pc as u64;

    let redirect_size = if near_jump(patch_addr as u64, wrapper).is_some() { NEAR_JMP_SIZE } else { FAR_JMP_SIZE };
    let (trampoline_slice, relocated) = match unsafe { build_trampoline(&mut alloc, patch_addr, redirect_size) } {
        Ok(built) => built,
        Err(e) => {
            unsafe { alloc.release(wrapper_slice) };
            return Err(e);
        }
    };
    let trampoline = trampoline_slice.pc as u64;

    let mut redirect = match near_jump(patch_addr as u64, wrapper) {
        Some(jmp) => jmp.to_vec(),
        None => far_jump(wrapper).to_vec(),
    };
    redirect.resize(relocated, 0x90);

    let original_bytes = unsafe { core::slice::from_raw_parts(patch_addr as *const u8, relocated).to_vec() };

    // The wrapper embeds the context's heap address, which the leak below keeps.
    let ctx = Box::new(FunctionContext {
        function,
        patch_addr,
        original_bytes,
        redirect,
        trampoline: trampoline as usize,
        wrapper: wrapper as usize,
        installed: AtomicBool::new(false),
        listeners: Mutex::new(vec![listener]),
    });

    let emitted = assemble_wrapper(&ctx, wrapper, trampoline)
        .map_err(|e| HookError::AssemblyFailed(e.to_string()))
        .and_then(|code| unsafe {
            wrapper_slice.write(&code)?;
            alloc.make_executable(&wrapper_slice)
        });
    if let Err(e) = emitted {
        unsafe {
            alloc.release(wrapper_slice);
            alloc.release(trampoline_slice);
        }
        return Err(e);
    }
    let ctx: &'static FunctionContext = Box::leak(ctx);

    log::debug!(
        "prepared hook on {:#x}: wrapper {:#x}, trampoline {:#x}, {} bytes relocated",
        function,
        wrapper,
        trampoline,
        relocated
    );
    Ok(ctx)
}

/// Copy whole instructions covering at least `redirect_size` bytes into a
/// fresh slab and append a jump back to the rest of the function.
///
/// Returns the trampoline slab and the number of bytes relocated. The slab
/// is released again if relocation fails.
unsafe fn build_trampoline(alloc: &mut CodeAllocator, patch_addr: usize, redirect_size: usize) -> Result<(CodeSlice, usize), HookError> {
    let slice = alloc.alloc_near(patch_addr as *const u8, NEAR_RANGE)?;
    match emit_trampoline(alloc, &slice, patch_addr, redirect_size) {
        Ok(relocated) => Ok((slice, relocated)),
        Err(e) => {
            alloc.release(slice);
            Err(e)
        }
    }
}

unsafe fn emit_trampoline(alloc: &CodeAllocator, slice: &CodeSlice, patch_addr: usize, redirect_size: usize) -> Result<usize, HookError> {
    let prologue = core::slice::from_raw_parts(patch_addr as *const u8, MAX_PROLOGUE);
    let mut decoder = Decoder::with_ip(64, prologue, patch_addr as u64, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut relocated = 0;
    while relocated < redirect_size {
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(HookError::RelocationFailed(format!(
                "undecodable instruction at {:#x}",
                instr.ip()
            )));
        }
        relocated += instr.len();
        instructions.push(instr);
    }

    let pc = slice.pc as u64;
    let block = InstructionBlock::new(&instructions, pc);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|e| HookError::RelocationFailed(e.to_string()))?;

    let mut code = encoded.code_buffer;
    code.extend_from_slice(&far_jump((patch_addr + relocated) as u64));
    slice.write(&code)?;
    alloc.make_executable(slice)?;
    Ok(relocated)
}

fn assemble_wrapper(ctx: &FunctionContext, wrapper: u64, trampoline: u64) -> Result<Vec<u8>, IcedError> {
    let gprs = [
        (rax, offset_of!(X86_64CpuContext, rax)),
        (rbx, offset_of!(X86_64CpuContext, rbx)),
        (rcx, offset_of!(X86_64CpuContext, rcx)),
        (rdx, offset_of!(X86_64CpuContext, rdx)),
        (rsi, offset_of!(X86_64CpuContext, rsi)),
        (rdi, offset_of!(X86_64CpuContext, rdi)),
        (rbp, offset_of!(X86_64CpuContext, rbp)),
        (r8, offset_of!(X86_64CpuContext, r8)),
        (r9, offset_of!(X86_64CpuContext, r9)),
        (r10, offset_of!(X86_64CpuContext, r10)),
        (r11, offset_of!(X86_64CpuContext, r11)),
        (r12, offset_of!(X86_64CpuContext, r12)),
        (r13, offset_of!(X86_64CpuContext, r13)),
        (r14, offset_of!(X86_64CpuContext, r14)),
        (r15, offset_of!(X86_64CpuContext, r15)),
    ];
    let arg_regs = [
        (rdi, offset_of!(X86_64CpuContext, rdi)),
        (rsi, offset_of!(X86_64CpuContext, rsi)),
        (rdx, offset_of!(X86_64CpuContext, rdx)),
        (rcx, offset_of!(X86_64CpuContext, rcx)),
        (r8, offset_of!(X86_64CpuContext, r8)),
        (r9, offset_of!(X86_64CpuContext, r9)),
        // AL carries the vector register count for variadic callees.
        (rax, offset_of!(X86_64CpuContext, rax)),
    ];
    let callee_saved = [
        (rbx, offset_of!(X86_64CpuContext, rbx)),
        (rbp, offset_of!(X86_64CpuContext, rbp)),
        (r12, offset_of!(X86_64CpuContext, r12)),
        (r13, offset_of!(X86_64CpuContext, r13)),
        (r14, offset_of!(X86_64CpuContext, r14)),
        (r15, offset_of!(X86_64CpuContext, r15)),
    ];
    let xmms = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];
    let xmm_base = offset_of!(X86_64CpuContext, xmm);
    let xmm_off = |i: usize| cpu_field(xmm_base + i * 16);

    let rip_off = cpu_field(offset_of!(X86_64CpuContext, rip));
    let rsp_off = cpu_field(offset_of!(X86_64CpuContext, rsp));
    let rflags_off = cpu_field(offset_of!(X86_64CpuContext, rflags));
    let rax_off = cpu_field(offset_of!(X86_64CpuContext, rax));
    let rdx_off = cpu_field(offset_of!(X86_64CpuContext, rdx));

    let mut a = CodeAssembler::new(64)?;
    let mut done = a.create_label();

    // ── Prologue: build the CPU context ──
    a.lea(rsp, qword_ptr(rsp - RED_ZONE))?;
    a.pushfq()?;
    a.sub(rsp, FRAME_SIZE)?;
    for (reg, off) in gprs {
        a.mov(qword_ptr(rsp + cpu_field(off)), reg)?;
    }
    for (i, reg) in xmms.iter().enumerate() {
        a.movdqu(xmmword_ptr(rsp + xmm_off(i)), *reg)?;
    }
    a.mov(r11, qword_ptr(rsp + FRAME_SIZE))?;
    a.mov(qword_ptr(rsp + rflags_off), r11)?;
    a.lea(r11, qword_ptr(rsp + CALLER_SP_OFF))?;
    a.mov(qword_ptr(rsp + rsp_off), r11)?;
    a.mov(r11, ctx.function as u64)?;
    a.mov(qword_ptr(rsp + rip_off), r11)?;

    // ── begin_invocation(ctx, &cpu) ──
    a.cld()?;
    a.mov(rdi, ctx as *const FunctionContext as u64)?;
    a.lea(rsi, qword_ptr(rsp + CPU_OFF))?;
    a.mov(r11, begin_invocation as usize as u64)?;
    a.call(r11)?;
    a.test(rax, rax)?;
    a.jnz(done)?;

    // ── Forward to the trampoline with the (possibly rewritten) arguments ──
    a.mov(r10, qword_ptr(rsp + rsp_off))?;
    for slot in 0..STACK_ARG_SLOTS {
        a.mov(r11, qword_ptr(r10 + slot * 8))?;
        a.mov(qword_ptr(rsp + slot * 8), r11)?;
    }
    for (reg, off) in arg_regs {
        a.mov(reg, qword_ptr(rsp + cpu_field(off)))?;
    }
    for (i, reg) in xmms.iter().enumerate() {
        a.movdqu(*reg, xmmword_ptr(rsp + xmm_off(i)))?;
    }
    a.push(qword_ptr(rsp + rflags_off))?;
    a.popfq()?;
    a.mov(r11, trampoline)?;
    a.call(r11)?;
    a.mov(qword_ptr(rsp + rax_off), rax)?;
    a.mov(qword_ptr(rsp + rdx_off), rdx)?;
    a.movdqu(xmmword_ptr(rsp + xmm_off(0)), xmm0)?;

    // ── Epilogue: return values from the context, restore callee-saved ──
    a.set_label(&mut done)?;
    a.mov(rax, qword_ptr(rsp + rax_off))?;
    a.mov(rdx, qword_ptr(rsp + rdx_off))?;
    a.movdqu(xmm0, xmmword_ptr(rsp + xmm_off(0)))?;
    for (reg, off) in callee_saved {
        a.mov(reg, qword_ptr(rsp + cpu_field(off)))?;
    }
    a.push(qword_ptr(rsp + rflags_off))?;
    a.popfq()?;
    a.lea(rsp, qword_ptr(rsp + FRAME_SIZE + 8 + RED_ZONE))?;
    a.ret()?;

    a.assemble(wrapper)
}
