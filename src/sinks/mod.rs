pub mod daily;
pub mod supabase;

use crate::config::Config;
use crate::error::Result;
use crate::traits::Forwarder;
use tracing::info;

/// Builds every remote forwarder whose credentials are configured.
pub fn build_forwarders(config: &Config) -> Result<Vec<Box<dyn Forwarder>>> {
    let mut forwarders: Vec<Box<dyn Forwarder>> = Vec::new();

    match (&config.supabase_url, &config.supabase_anon_key) {
        (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() && !config.supabase_table.is_empty() => {
            forwarders.push(Box::new(supabase::SupabaseForwarder::new(
                url,
                key,
                &config.supabase_table,
            )?));
        }
        _ => info!("Supabase credentials missing, results stay local"),
    }

    Ok(forwarders)
}
