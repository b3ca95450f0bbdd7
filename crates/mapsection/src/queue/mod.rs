mod fair;
#[cfg(test)]
mod tests;

pub use fair::*;
