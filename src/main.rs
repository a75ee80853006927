/*!
# Ouroboros Node

## Help

```bash
ouroboros_rust --help
```

## Example Usage

```bash
ouroboros_rust --config config --run_secs 30
```
*/

use ouroboros_rust::node;

#[tokio::main]
pub async fn main() -> ouroboros_rust::Result<()> {
    tracing_subscriber::fmt::init();
    node::run().await
}
