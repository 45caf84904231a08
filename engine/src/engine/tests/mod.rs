// Tests for the engine internals: frame registration, drain passes, and
// participant counting, driven synchronously.

mod helpers;
