// Licensed under the Apache-2.0 license

mod common;
mod test_boot;
mod test_crypto;
mod test_csr;
mod test_platform;
mod test_protected_update;
mod test_router;
