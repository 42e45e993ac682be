// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Logging setup (§10.2). Pairs the `log` facade used throughout
//! the crate with `env_logger`, configured entirely through `RUST_LOG`.

pub(crate) fn init_logging() {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
