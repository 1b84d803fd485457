/// Collector operations mirroring the interpreter's fixed `lua_gc` set.
///
/// `Count` reports kibibytes in use, `CountBytes` the remainder bytes below
/// one kibibyte; `Step` and `IsRunning` report a boolean as an integer; the
/// control operations report zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOperation {
    Stop,
    Restart,
    Collect,
    Count,
    CountBytes,
    Step,
    IsRunning,
}
