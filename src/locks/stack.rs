//! Locks held by this process, for cleanup at exit.

use super::record::LockNames;

#[derive(Debug, Default)]
pub struct LockStack {
    frames: Vec<LockNames>,
}

impl LockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, names: LockNames) {
        self.frames.push(names);
    }

    /// Drop every frame for `lock`. Returns how many were removed.
    pub fn remove(&mut self, lock: &str) -> usize {
        let before = self.frames.len();
        self.frames.retain(|frame| frame.lock != lock);
        before - self.frames.len()
    }

    pub fn pop(&mut self) -> Option<LockNames> {
        self.frames.pop()
    }

    /// Take all frames, most recently acquired first.
    pub fn drain_all(&mut self) -> Vec<LockNames> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(op: &str) -> LockNames {
        LockNames::new("b", "o", op, "d")
    }

    #[test]
    fn test_remove_matching_only() {
        let mut stack = LockStack::new();
        stack.push(names("a"));
        stack.push(names("b"));
        stack.push(names("a"));

        assert_eq!(stack.remove(&names("a").lock), 2);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.remove(&names("zzz").lock), 0);
    }

    #[test]
    fn test_drain_newest_first() {
        let mut stack = LockStack::new();
        stack.push(names("first"));
        stack.push(names("second"));

        let drained = stack.drain_all();
        assert_eq!(drained, vec![names("second"), names("first")]);
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
    }
}
