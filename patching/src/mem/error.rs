use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Interceptor table state is poisoned")]
    BadTableState,

    #[error("Failed to allocate memory within {max_distance:#x} of {target:#x}")]
    CantAllocateNear { target: usize, max_distance: usize },

    #[error("Failed to set memory protection. Address: {0:x}")]
    CantSetMemoryProtection(usize),

    #[error("Failed to query memory protection. Address: {0:x}")]
    CantQueryMemoryProtection(usize),

    #[error("Address {0:#x} is not mapped")]
    Unmapped(usize),

    #[error("Not enough memory left in heap. Needs: {needs} | Has: {has}")]
    NoMemory { needs: usize, has: usize },

    #[error("Cant find module: {0}")]
    CantFindModule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
