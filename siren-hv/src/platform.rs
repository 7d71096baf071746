//! Platform Services Module
//!
//! The hypervisor core never talks to the operating system directly. The
//! driver shell registers a [`PlatformOps`] table once at load time and the
//! core routes every environmental request through it: virtual-to-physical
//! translation for nonpaged allocations, processor topology, IPI fan-out,
//! and the debugger.
//!
//! Unit tests register [`IDENTITY_OPS`], which treats virtual addresses as
//! physical and runs all "broadcasts" inline on the calling thread. That is
//! what makes the EPT engine and the identity-map builder host-testable.

use spin::Once;

/// Services the embedding driver must provide.
///
/// All callbacks use plain function pointers with a context pointer so the
/// table can live in static storage and be used above DISPATCH level.
pub struct PlatformOps {
    /// Translate the virtual address of a nonpaged, page-aligned allocation
    /// to its physical address.
    pub virt_to_phys: fn(*const u8) -> u64,
    /// Map (or locate the existing mapping of) the physical page at the
    /// given address. Used for the pages the parent hypervisor hands out by
    /// physical address.
    pub phys_to_virt: fn(u64) -> *mut u8,
    /// Number of active logical processors.
    pub cpu_count: fn() -> u32,
    /// Index of the calling logical processor.
    pub current_cpu: fn() -> u32,
    /// Run `callback(context)` on every logical processor at IPI level and
    /// wait for all of them to finish.
    pub ipi_broadcast: fn(callback: fn(*mut ()), context: *mut ()),
    /// Run `callback(context)` on the given processor and wait.
    pub run_on_cpu: fn(cpu: u32, callback: fn(*mut ()), context: *mut ()),
    /// Break into the attached kernel debugger.
    pub debug_break: fn(),
}

static PLATFORM: Once<&'static PlatformOps> = Once::new();

/// Registers the platform table. The first registration wins; later calls
/// are ignored.
pub fn register(ops: &'static PlatformOps) {
    PLATFORM.call_once(|| ops);
}

/// Returns the registered table.
///
/// # Panics
///
/// Panics if no table was registered. Initialization order guarantees the
/// driver shell registers before the hypervisor is constructed.
pub fn ops() -> &'static PlatformOps {
    PLATFORM.get().expect("platform services not registered")
}

pub fn virt_to_phys<T>(p: *const T) -> u64 {
    (ops().virt_to_phys)(p.cast())
}

pub fn phys_to_virt(pa: u64) -> *mut u8 {
    (ops().phys_to_virt)(pa)
}

pub fn cpu_count() -> u32 {
    (ops().cpu_count)()
}

pub fn current_cpu() -> u32 {
    (ops().current_cpu)()
}

pub fn ipi_broadcast(callback: fn(*mut ()), context: *mut ()) {
    (ops().ipi_broadcast)(callback, context)
}

pub fn run_on_cpu(cpu: u32, callback: fn(*mut ()), context: *mut ()) {
    (ops().run_on_cpu)(cpu, callback, context)
}

pub fn debug_break() {
    (ops().debug_break)()
}

/// Identity platform: VA==PA, one processor, fan-out runs inline. Suitable
/// for unit tests and for environments with identity-mapped page tables.
pub static IDENTITY_OPS: PlatformOps = PlatformOps {
    virt_to_phys: |p| p as u64,
    phys_to_virt: |pa| pa as *mut u8,
    cpu_count: || 1,
    current_cpu: || 0,
    ipi_broadcast: |callback, context| callback(context),
    run_on_cpu: |_cpu, callback, context| callback(context),
    debug_break: || {},
};

#[cfg(test)]
pub(crate) fn register_identity_for_tests() {
    register(&IDENTITY_OPS);
}
