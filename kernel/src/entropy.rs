//! Entropy source for `dev/random`, `getentropy`, and friends.
//!
//! Prefers the RDRAND instruction when the CPU advertises it (CPUID leaf 1,
//! ECX bit 30); otherwise falls back to an xorshift64* generator seeded from
//! the timestamp counter. Nothing here is cryptographic -- dyld only needs
//! pointer-authentication cookies and malloc seeds to be non-constant.

use core::sync::atomic::{AtomicU64, Ordering};

static STATE: AtomicU64 = AtomicU64::new(0);

/// Check whether the CPU supports the RDRAND instruction.
///
/// Executing RDRAND without this guard triggers #UD on CPUs that lack the
/// feature.
fn cpu_has_rdrand() -> bool {
    // SAFETY: CPUID with EAX=1 is a read-only, side-effect-free instruction
    // returning CPU feature information; it is always available in long
    // mode. The intrinsic handles the LLVM-reserved RBX register itself.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    (leaf.ecx & (1 << 30)) != 0
}

fn rdrand_u64() -> Option<u64> {
    if !cpu_has_rdrand() {
        return None;
    }
    let mut value: u64 = 0;
    for _ in 0..10 {
        // SAFETY: RDRAND support was verified via CPUID above, so the
        // instruction cannot fault; it writes a hardware random u64 into
        // `value` and reports success in its return value.
        if unsafe { core::arch::x86_64::_rdrand64_step(&mut value) } == 1 {
            return Some(value);
        }
    }
    None
}

fn xorshift_u64() -> u64 {
    let mut x = STATE.load(Ordering::Relaxed);
    if x == 0 {
        // SAFETY: RDTSC is always available on x86_64 and merely reads the
        // time stamp counter.
        x = unsafe { core::arch::x86_64::_rdtsc() } | 1;
    }
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    STATE.store(x, Ordering::Relaxed);
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Produce the next 64 random bits.
pub fn next_u64() -> u64 {
    rdrand_u64().unwrap_or_else(xorshift_u64)
}

/// Fill `dest` with random bytes.
pub fn fill_bytes(dest: &mut [u8]) {
    for chunk in dest.chunks_mut(8) {
        let word = next_u64().to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_bytes_covers_buffer() {
        let mut buf = [0u8; 37];
        fill_bytes(&mut buf);
        // 37 bytes of output being all zero is vanishingly unlikely from
        // either source.
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_next_u64_varies() {
        let a = next_u64();
        let b = next_u64();
        assert_ne!(a, b);
    }
}
