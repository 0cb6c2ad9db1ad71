use snipl::CapacityRecord;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example:
    //   cargo run --example capacity_record -- record.xml
    let path = std::env::args().nth(1).ok_or("missing <record.xml>")?;
    let xml = std::fs::read_to_string(path)?;
    let record = CapacityRecord::from_xml(&xml)?;

    let status = if record.is_active() {
        format!("Active-{} (Attention!)", record.status)
    } else {
        "Installed".to_owned()
    };
    println!("Record ID: {} Status: {status}", record.id);
    println!("Record Type: {}", record.kind);
    println!("Expiration: {}", record.expiration);
    if let Some(start) = &record.last_activation {
        println!("Last Activation Time: {start} GMT");
    }
    println!(
        "Real activations: {} ({} days), test activations: {} ({} days)",
        record.real.remaining_activations,
        record.real.remaining_days,
        record.test.remaining_activations,
        record.test.remaining_days
    );
    for cpu in &record.cpus {
        println!(
            "{:<6} step {:>3} max {:>3} days {:>4}",
            cpu.kind, cpu.proc_step, cpu.max, cpu.remaining_proc_days
        );
    }
    if let Some(model) = record.current_model() {
        println!("Current model: {model}");
    }
    for target in &record.targets {
        println!(
            "Target {} cost {} delta {}",
            target.software_model, target.msu_cost, target.msu_delta
        );
    }
    Ok(())
}
