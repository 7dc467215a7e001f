//! Quick benchmark to verify plan construction and expression scanning performance

use std::sync::Arc;
use std::time::Instant;

use provplan::binding::scan_str;
use provplan::{generate_token, ModuleRegistry, Plan, PlanInputs, Template};

fn main() {
    let template = Template::builtin().unwrap();
    let registry = Arc::new(ModuleRegistry::builtin());
    let inputs = PlanInputs::new("00000000-0000-0000-0000-000000000000")
        .with_param("environmentName", "dev")
        .with_param("location", "eastus");

    // Expressions of varying complexity
    let expressions = vec![
        "plain text with no references",
        "kv-{{ token }}",
        "rg-{{ param.environmentName }}",
        "{{ cosmos.outputs.endpoint }}",
        "{{ param.serviceName }}-{{ token }} in {{ param.location }} via {{ registry.outputs.loginServer }}",
    ];

    println!("Expression Scanning Performance Test");
    println!("====================================\n");

    for expression in &expressions {
        let iterations = 100_000;
        let start = Instant::now();

        for _ in 0..iterations {
            let _ = scan_str(expression);
        }

        let elapsed = start.elapsed();
        let per_op = elapsed / iterations;

        println!("Expression: {:60}", format!("\"{}\"", expression));
        println!("  Time for {} iterations: {:?}", iterations, elapsed);
        println!("  Per operation: {:?}\n", per_op);
    }

    println!("Token Generation");
    println!("================\n");

    let iterations = 1_000_000;
    let start = Instant::now();
    for i in 0..iterations {
        let _ = generate_token("sub", if i % 2 == 0 { "dev" } else { "prod" }, "eastus");
    }
    let elapsed = start.elapsed();
    println!("  {} tokens: {:?}", iterations, elapsed);
    println!("  Per token: {:?}\n", elapsed / iterations);

    println!("Plan Construction (built-in template)");
    println!("=====================================\n");

    let iterations = 10_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let _ = Plan::build(&template, Arc::clone(&registry), &inputs).unwrap();
    }
    let elapsed = start.elapsed();
    println!("  Time for {} plans: {:?}", iterations, elapsed);
    println!("  Per plan: {:?}", elapsed / iterations);
}
