use crate::infra::{next_monday, seeded_directory};
use agenda::error::AppError;
use agenda::scheduling::{
    Actor, Appointment, AuditQuery, BookingRequest, ClientId, InMemoryStore, RequestContext,
    Role, SchedulingEngine, SchedulingError, SchedulingPolicy, ServiceId, StaffId, SystemClock,
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Business day to book on (YYYY-MM-DD). Defaults to next Monday.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) date: Option<NaiveDate>,
    /// Staff member taking both bookings.
    #[arg(long, default_value = "staff-ana")]
    pub(crate) staff: String,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs { date, staff } = args;
    let date = date.unwrap_or_else(|| next_monday(Local::now().date_naive()));

    let clock = Arc::new(SystemClock);
    let policy = SchedulingPolicy::default();
    let at = |hour: u32, minute: u32| -> Result<DateTime<Utc>, AppError> {
        date.and_hms_opt(hour, minute, 0)
            .and_then(|local| local.and_local_timezone(policy.offset()).single())
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{date} {hour:02}:{minute:02} is not a valid local time"),
                ))
            })
    };
    let (nine, half_past, ten) = (at(9, 0)?, at(9, 30)?, at(10, 0)?);

    let engine = SchedulingEngine::new(
        Arc::new(InMemoryStore::with_clock(clock.clone())),
        Arc::new(seeded_directory().map_err(SchedulingError::from)?),
        clock,
        policy,
    );
    let reception = RequestContext::new(Actor::new("reception", "Reception", Role::Master));
    let request = |client: &str, start: DateTime<Utc>| BookingRequest {
        client: ClientId(client.to_string()),
        client_name: Some(format!("Client {}", client.to_uppercase())),
        staff: StaffId(staff.clone()),
        service: ServiceId("consulta".to_string()),
        start,
        notes: None,
        final_price: None,
    };

    println!("Appointment scheduling demo ({})", engine.policy().describe());
    println!("Booking {} for {date}\n", staff);

    let first = engine.propose(&reception, request("a", nine))?;
    print_booked(&first);

    match engine.propose(&reception, request("b", half_past)) {
        Ok(unexpected) => print_booked(&unexpected),
        Err(err) => println!("  rejected  {} ({})", err, err.kind()),
    }

    let second = engine.propose(&reception, request("b", ten))?;
    print_booked(&second);

    let cancelled = engine.cancel(&reception, &second.id)?;
    println!("  cancelled {} -> {}", cancelled.id, cancelled.status.label());

    println!("\nAudit trail");
    let entries = engine
        .audit_trail()
        .history(&AuditQuery::default())
        .map_err(SchedulingError::from)?;
    for entry in entries {
        println!("  #{:<3} {}", entry.sequence, entry.summary());
    }

    Ok(())
}

fn print_booked(appointment: &Appointment) {
    println!(
        "  booked    {} {} until {} at {}",
        appointment.id,
        appointment.summary(),
        appointment.end().format("%H:%M"),
        appointment.final_price
    );
}
