/*!
# Ouroboros Mini-Protocols

An implementation of the node-to-node and node-to-client mini-protocols used
by Ouroboros nodes, together with the ledger structures carried by them.

* `protocol`: the generic mini-protocol engine (state map, agency, timeouts,
  segment reassembly) and the keep-alive and local-state-query protocols
  built on it
* `cbor`: the tagged-variant codec shared by messages and ledger types
* `ledger`: certificates, pool relays, MIR rewards and era-tagged blocks
* `node`: a runtime wiring client and server over a loopback connection

# Usage

```bash
ouroboros_rust --config config --run_secs 30
```

Every key in the config file is optional. See `settings::Settings`.
*/
#[macro_use]
extern crate lazy_static;

pub mod cbor;
pub mod ledger;
pub mod node;
pub mod protocol;
pub mod settings;

mod test_setup;

/// Error returned by most functions.
///
/// Protocol and codec failures have their own error types. This boxed error
/// is used at the edges: callbacks, configuration and the runtime.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for ouroboros operations.
pub type Result<T> = std::result::Result<T, Error>;
