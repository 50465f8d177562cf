//! aarch64 (AAPCS64) context stubs.
//!
//! Register file layout within `Context::regs`:
//! 0-9: x19-x28, 10: x29 (fp), 11: x30 (lr, the resume pc), 12: sp,
//! 13-20: d8-d15.

use core::arch::global_asm;

global_asm!(
    r#"
    .text
    .globl weft_capture_context
    .p2align 4
weft_capture_context:
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]
    mov x9, sp
    str x9, [x0, #96]
    stp d8, d9, [x0, #104]
    stp d10, d11, [x0, #120]
    stp d12, d13, [x0, #136]
    stp d14, d15, [x0, #152]
    mov x0, #0
    ret

    .globl weft_jump_context
    .p2align 4
weft_jump_context:
    ldp x19, x20, [x0, #0]
    ldp x21, x22, [x0, #16]
    ldp x23, x24, [x0, #32]
    ldp x25, x26, [x0, #48]
    ldp x27, x28, [x0, #64]
    ldp x29, x30, [x0, #80]
    ldr x9, [x0, #96]
    mov sp, x9
    ldp d8, d9, [x0, #104]
    ldp d10, d11, [x0, #120]
    ldp d12, d13, [x0, #136]
    ldp d14, d15, [x0, #152]
    mov x0, #1
    ret

    .globl weft_start_context
    .p2align 4
weft_start_context:
    mov sp, x0
    mov x29, xzr
    mov x30, xzr
    br x1
    brk #0x1
"#
);
