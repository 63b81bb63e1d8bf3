//! Example demonstrating session tracing against the simulated key.
//!
//! Run with: cargo run -p biokey-core --example mock_enrollment

use biokey_core::{
    BiometricTemplateRegistry, CollectorResponse, DeviceSelector, DeviceSessionManager,
    MockTransport, VerificationRequest,
};
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    // Initialize tracing subscriber with debug level
    fmt()
        .with_env_filter(EnvFilter::new("biokey_core=debug,info"))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    println!("=== Simulated Enrollment Demo ===\n");

    let collector = |request: &VerificationRequest| {
        println!("  prompt: {request:?}");
        match request {
            VerificationRequest::Pin { .. } => CollectorResponse::Pin("123456".into()),
            _ => CollectorResponse::Proceed,
        }
    };
    let mut manager = DeviceSessionManager::new(MockTransport::demo(), collector);

    let device = match manager.connect(DeviceSelector::Auto) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            return;
        }
    };
    println!("Connected: {device}\n");

    let result = manager.with_session(|session| {
        let mut registry = BiometricTemplateRegistry::new(session);
        let enrolled = registry.enroll("RightThumb")?;
        Ok((enrolled, registry.enumerate()?))
    });

    match result {
        Ok((enrolled, templates)) => {
            println!("\n✅ Enrolled {} as {}", enrolled.display_name(), enrolled.id);
            for template in templates {
                println!("   {}  {}", template.id, template.display_name());
            }
        }
        Err(e) => {
            println!("\n❌ Failed: {}", e);
        }
    }

    manager.disconnect();
}
