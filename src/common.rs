/// Balance amounts in minor units (hundredths of a currency unit).
pub type Cents = i64;

/// Identifies one dispatched unit of work for the lifetime of the process.
pub type JobId = u64;
