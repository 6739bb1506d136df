use serde_json::Value;

pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub fn print_status(info: &Value, machines: &[Value]) {
    println!(
        "{} (version {})",
        info["message"].as_str().unwrap_or("unknown"),
        info["version"].as_str().unwrap_or("?")
    );
    let mut by_status: Vec<(String, usize)> = Vec::new();
    for machine in machines {
        let status = machine["status"].as_str().unwrap_or("?").to_string();
        match by_status.iter_mut().find(|(s, _)| *s == status) {
            Some((_, count)) => *count += 1,
            None => by_status.push((status, 1)),
        }
    }
    println!("{} machine(s) in the pool", machines.len());
    for (status, count) in by_status {
        println!("  {:10} {}", status, count);
    }
}

pub fn print_machines(machines: &[Value]) {
    if machines.is_empty() {
        println!("no machines matched");
        return;
    }
    for machine in machines {
        println!(
            "{}  {:30}  {:10}  {}",
            machine["magic"].as_str().unwrap_or("?"),
            machine["hostname"].as_str().unwrap_or("-"),
            machine["status"].as_str().unwrap_or("?"),
            machine["provisioner"].as_str().unwrap_or("-"),
        );
    }
}
