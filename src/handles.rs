//! 세션 핸들 테이블
//!
//! 불투명한 정수 핸들로 살아 있는 세션을 소유합니다.
//! 핸들은 정확히 한 번 해제되어야 하며, 해제된 핸들은 재사용되지 않습니다.
//! 해제 후 조회나 이중 해제는 `CdcError::InvalidHandle`입니다.

use crate::error::{CdcError, Result};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct SessionArena<T> {
    next: u64,
    slots: HashMap<u64, T>,
}

impl<T> Default for SessionArena<T> {
    fn default() -> Self {
        SessionArena::new()
    }
}

impl<T> SessionArena<T> {
    pub fn new() -> Self {
        SessionArena {
            // 0은 "핸들 없음"으로 남겨 둠
            next: 1,
            slots: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, value: T) -> SessionHandle {
        let id = self.next;
        self.next += 1;
        self.slots.insert(id, value);
        SessionHandle(id)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Result<&mut T> {
        self.slots
            .get_mut(&handle.0)
            .ok_or(CdcError::InvalidHandle(handle.0))
    }

    /// 핸들을 해제하고 소유권을 돌려줌
    pub fn free(&mut self, handle: SessionHandle) -> Result<T> {
        self.slots
            .remove(&handle.0)
            .ok_or(CdcError::InvalidHandle(handle.0))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lookup_free() {
        let mut arena = SessionArena::new();
        let a = arena.allocate("a");
        let b = arena.allocate("b");
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert_eq!(*arena.get_mut(a).unwrap(), "a");

        *arena.get_mut(b).unwrap() = "bb";
        assert_eq!(arena.free(b).unwrap(), "bb");
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_lookup_after_free_is_error() {
        let mut arena = SessionArena::new();
        let handle = arena.allocate(42);
        arena.free(handle).unwrap();

        assert!(matches!(arena.get_mut(handle), Err(CdcError::InvalidHandle(id)) if id == handle.id()));
        assert!(matches!(arena.free(handle), Err(CdcError::InvalidHandle(_))));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut arena = SessionArena::new();
        let first = arena.allocate(1);
        arena.free(first).unwrap();
        let second = arena.allocate(2);
        assert_ne!(first, second);
        assert!(arena.get_mut(first).is_err());
        assert_eq!(first.id(), 1);
    }
}
