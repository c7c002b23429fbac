//! Show how a 535-series client request is reshaped for a 550-series driver

use nvshim::registry::commands::{UVM_ALLOC_SEMAPHORE_POOL, UVM_MAP_EXTERNAL_ALLOCATION, UVM_SET_PREFERRED_LOCATION};
use nvshim::{AbiConfig, CommandRegistry, DriverVersion};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔀 nvshim Version Skew Example");
    println!("==============================\n");

    let registry = CommandRegistry::uvm(AbiConfig::default())?;
    let client: DriverVersion = "535.104.05".parse()?;
    let host: DriverVersion = "550.54.14".parse()?;

    for code in [UVM_MAP_EXTERNAL_ALLOCATION, UVM_ALLOC_SEMAPHORE_POOL, UVM_SET_PREFERRED_LOCATION] {
        let from = registry.resolve(code, client)?;
        let to = registry.resolve(code, host)?;
        println!("{} → {}", from.name(), to.name());
        println!("  size: {} → {} bytes", from.total_width(), to.total_width());

        for field in to.data_fields() {
            let before = from.field(field.name).map(|f| f.offset);
            match before {
                Some(offset) if offset == field.offset => {}
                Some(offset) => println!("  {:<24} moved {} → {} ({})", field.name, offset, field.offset, field.compat),
                None => println!("  {:<24} new at {} ({})", field.name, field.offset, field.compat),
            }
        }

        let raw = vec![0u8; from.total_width()];
        let widened = nvshim::translate(&raw, from, to)?;
        println!("  translated request: {} bytes\n", widened.len());
    }

    Ok(())
}
