//! The runtime seam.
//!
//! The GPU runtime is an external collaborator. It hands the core opaque
//! handles and a table of entry points; the core never links against it.
//! The [`HsaRuntime`] trait is the shape of that table, and an
//! [`ApiTableSnapshot`] is the immutable capture taken at tool-configure
//! time. Runtime callbacks (code-object load, executable freeze/destroy,
//! function registration) arrive as explicit methods on the components
//! that consume them.

pub mod cache;
pub mod packet;
pub mod symbol;
pub mod testing;

use crate::error::Result;
use std::fmt;
use std::sync::Arc;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

opaque_handle!(
    /// One GPU device.
    Agent
);
opaque_handle!(
    /// A runtime executable: a container of frozen loaded code objects.
    ExecutableHandle
);
opaque_handle!(
    /// One code object loaded onto one agent inside one executable.
    LcoHandle
);
opaque_handle!(
    /// A runtime-visible executable symbol.
    SymbolHandle
);

/// Placement of a freshly loaded code object in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInfo {
    pub handle: LcoHandle,
    /// Device address of the first loaded byte.
    pub load_base: u64,
    pub load_size: u64,
    /// `loaded_address - file_virtual_address`, signed.
    pub load_delta: i64,
}

/// What the runtime reports for a symbol inside a frozen executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSymbolInfo {
    pub handle: SymbolHandle,
    pub name: String,
    /// Loaded device address of the symbol.
    pub device_address: u64,
    /// For kernels, the loaded address of the kernel descriptor — the
    /// value dispatch packets carry in `kernel_object`.
    pub kernel_object: Option<u64>,
}

/// The function-pointer tables of the GPU runtime, as a trait.
///
/// Implementations must be thread-safe; the core calls in from arbitrary
/// application threads under runtime callbacks.
pub trait HsaRuntime: Send + Sync {
    /// Copies `size` bytes of device memory into a host buffer.
    fn read_device_memory(&self, agent: Agent, address: u64, size: u64) -> Result<Vec<u8>>;

    fn create_executable(&self, agent: Agent) -> Result<ExecutableHandle>;

    /// Defines an agent-external variable before loading.
    fn define_external(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        name: &str,
        address: u64,
    ) -> Result<()>;

    /// Loads a code object into the executable, returning its placement.
    fn load_code_object(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        bytes: &[u8],
    ) -> Result<LoadInfo>;

    fn freeze_executable(&self, exec: ExecutableHandle) -> Result<()>;

    fn destroy_executable(&self, exec: ExecutableHandle) -> Result<()>;

    fn symbol_by_name(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        name: &str,
    ) -> Result<RuntimeSymbolInfo>;
}

/// Immutable capture of the runtime's API tables.
///
/// Cheap to clone; every long-lived component holds one.
#[derive(Clone)]
pub struct ApiTableSnapshot {
    runtime: Arc<dyn HsaRuntime>,
}

impl ApiTableSnapshot {
    pub fn capture(runtime: Arc<dyn HsaRuntime>) -> Self {
        ApiTableSnapshot { runtime }
    }

    pub fn table(&self) -> &dyn HsaRuntime {
        &*self.runtime
    }
}

impl fmt::Debug for ApiTableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiTableSnapshot")
    }
}
