//! Generated IRQ/exception entry stubs and the common trap prologue.
//!
//! Each stub pushes a dummy error code (unless the CPU pushed a real one)
//! and its vector number, then jumps to `alltraps`, which completes the
//! `TrapFrame` layout, switches the data segments to the kernel selector,
//! and calls into `trap::trap_dispatch`.

// Vectors 8, 10-14 and 17 get a CPU-supplied error code; everything else
// pushes a zero so the frame layout is uniform.
core::arch::global_asm!(
    r#"
    .altmacro
    .macro VECTOR n
    vector\n:
        .if (\n == 8) || ((\n >= 10) && (\n <= 14)) || (\n == 17)
        .else
        push 0
        .endif
        push \n
        jmp alltraps
    .endm

    .section .text
    .set i, 0
    .rept 256
        VECTOR %i
        .set i, i + 1
    .endr

    .globl alltraps
    alltraps:
        push ds
        push es
        push fs
        push gs
        pusha
        mov ax, 0x10
        mov ds, ax
        mov es, ax
        mov fs, ax
        mov gs, ax
        push esp
        call trap_dispatch
        add esp, 4
    .globl trapret
    trapret:
        popa
        pop gs
        pop fs
        pop es
        pop ds
        add esp, 8
        iret

    .macro VECREF n
        .long vector\n
    .endm

    .section .rodata
    .globl vector_table
    vector_table:
    .set i, 0
    .rept 256
        VECREF %i
        .set i, i + 1
    .endr
    "#
);

extern "C" {
    static vector_table: [u32; 256];
    pub fn trapret() -> !;
}

/// Entry address of the stub for `vector`.
pub fn stub(vector: usize) -> u32 {
    // SAFETY: the table is generated above with exactly 256 entries.
    unsafe { vector_table[vector] }
}
