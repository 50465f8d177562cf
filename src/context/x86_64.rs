//! x86_64 (System V) context stubs.
//!
//! Register file layout within `Context::regs`:
//! 0: rip, 1: rsp, 2: rbp, 3: rbx, 4: r12, 5: r13, 6: r14, 7: r15.
//! xmm registers are caller-saved under this ABI and are not captured.

use core::arch::global_asm;

global_asm!(
    r#"
    .text
    .globl weft_capture_context
    .p2align 4
weft_capture_context:
    mov rax, [rsp]
    lea rcx, [rsp + 8]
    mov [rdi + 0], rax
    mov [rdi + 8], rcx
    mov [rdi + 16], rbp
    mov [rdi + 24], rbx
    mov [rdi + 32], r12
    mov [rdi + 40], r13
    mov [rdi + 48], r14
    mov [rdi + 56], r15
    xor eax, eax
    ret

    .globl weft_jump_context
    .p2align 4
weft_jump_context:
    mov rbp, [rdi + 16]
    mov rbx, [rdi + 24]
    mov r12, [rdi + 32]
    mov r13, [rdi + 40]
    mov r14, [rdi + 48]
    mov r15, [rdi + 56]
    mov rsp, [rdi + 8]
    mov rcx, [rdi + 0]
    mov eax, 1
    jmp rcx

    .globl weft_start_context
    .p2align 4
weft_start_context:
    mov rsp, rdi
    xor ebp, ebp
    push rbp
    jmp rsi
    ud2
"#
);
