//! `sdstore polling` — Tier 2 reconciler status.

use super::args::PollingCommands;
use super::util::{build_coordinator, fail};

pub async fn handle(command: PollingCommands) {
    match command {
        PollingCommands::Status => status().await,
    }
}

async fn status() {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };

    let status = coordinator.polling_status().await;
    println!("queued entries:        {}", status.queued_entries);
    println!("over memory bound:     {}", status.over_memory_bound);
    println!("poll rate / minute:    {}", status.settings.poll_rate_per_minute);
    println!("hit rate multiplier:   {}", status.settings.hit_rate_multiplier);
    println!("max burst / second:    {}", status.settings.max_burst_per_second);
    println!("normal priority reserve: {}", status.settings.normal_priority_reserve);
}
