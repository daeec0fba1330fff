//! The module containing wrapper functions for x86 instructions.
//!
//! The `x86` crate exposes most of these as `unsafe` functions because they
//! require CPL0 or other preconditions. This kernel always runs at CPL0
//! with the preconditions satisfied, so the wrappers here are safe to call
//! from any context.

use x86::{
    controlregs::{Cr0, Cr4},
    dtables::DescriptorTablePointer,
};

/// Returns the timestamp counter value.
pub(crate) fn rdtsc() -> u64 {
    // Safety: this kernel runs at CPL0.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads an MSR.
pub(crate) fn rdmsr(msr: u32) -> u64 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to an MSR.
pub(crate) fn wrmsr(msr: u32, value: u64) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads the CR0 register.
pub(crate) fn cr0() -> Cr0 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::controlregs::cr0() }
}

/// Writes a value to the CR0 register.
pub(crate) fn cr0_write(val: Cr0) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::controlregs::cr0_write(val) };
}

/// Reads the CR3 register.
pub(crate) fn cr3() -> u64 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::controlregs::cr3() }
}

/// Reads the CR4 register.
pub(crate) fn cr4() -> Cr4 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::controlregs::cr4() }
}

/// Writes a value to the CR4 register.
pub(crate) fn cr4_write(val: Cr4) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::controlregs::cr4_write(val) };
}

/// Disables maskable interrupts.
pub(crate) fn cli() {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::irq::disable() };
}

/// Halts execution of the processor.
pub(crate) fn hlt() {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::halt() };
}

/// Reads 8-bits from an IO port.
pub(crate) fn inb(port: u16) -> u8 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
pub(crate) fn outb(port: u16, val: u8) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::io::outb(port, val) };
}

/// Reads 16-bits from an IO port.
pub(crate) fn inw(port: u16) -> u16 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::io::inw(port) }
}

/// Writes 16-bits to an IO port.
pub(crate) fn outw(port: u16, val: u16) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::io::outw(port, val) };
}

/// Reads 32-bits from an IO port.
pub(crate) fn inl(port: u16) -> u32 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::io::inl(port) }
}

/// Writes 32-bits to an IO port.
pub(crate) fn outl(port: u16, val: u32) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::io::outl(port, val) };
}

/// Reads the IDTR register.
pub(crate) fn sidt<T>(idtr: &mut DescriptorTablePointer<T>) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::dtables::sidt(idtr) };
}

/// Reads the GDTR.
pub(crate) fn sgdt<T>(gdtr: &mut DescriptorTablePointer<T>) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::dtables::sgdt(gdtr) };
}

/// Returns the CPU vendor string from CPUID leaf 0.
pub(crate) fn cpu_vendor() -> [u8; 12] {
    let result = x86::cpuid::CpuId::new();
    let vendor = result.get_vendor_info().unwrap();
    let mut bytes = [0u8; 12];
    bytes.copy_from_slice(vendor.as_str().as_bytes());
    bytes
}

/// Runs CPUID for the given leaf and subleaf.
pub(crate) fn cpuid(leaf: u32, subleaf: u32) -> x86::cpuid::CpuIdResult {
    x86::cpuid::cpuid!(leaf, subleaf)
}
