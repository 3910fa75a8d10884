//! Content identity -> (site, native id) pairs.

use crate::error::{PipelineError, PipelineResult};
use crate::model::{SourceConfig, Target, TargetSelector};

/// Resolve the sites a request writes to. An empty result is never returned;
/// a selector that matches nothing is `TargetUnavailable`.
pub fn resolve_targets(
    post_id: &str,
    cfg: &SourceConfig,
    selector: &TargetSelector,
    home_site: Option<&str>,
) -> PipelineResult<Vec<Target>> {
    let unavailable = |reason: String| PipelineError::TargetUnavailable {
        post_id: post_id.to_string(),
        reason,
    };
    let pick = |site: &str| {
        cfg.site_targets
            .get(site)
            .filter(|id| !id.trim().is_empty())
            .map(|id| Target {
                site: site.to_string(),
                native_id: id.trim().to_string(),
            })
    };

    match selector {
        TargetSelector::Default => {
            let site = cfg
                .default_site
                .as_deref()
                .or(home_site)
                .ok_or_else(|| unavailable("no default site configured".into()))?;
            pick(site)
                .map(|t| vec![t])
                .ok_or_else(|| unavailable(format!("no document mapped on default site '{site}'")))
        }
        TargetSelector::All => {
            let all: Vec<Target> = cfg.site_targets.keys().filter_map(|k| pick(k)).collect();
            if all.is_empty() {
                Err(unavailable("no site targets configured".into()))
            } else {
                Ok(all)
            }
        }
        TargetSelector::Site(site) => pick(site)
            .map(|t| vec![t])
            .ok_or_else(|| unavailable(format!("no document mapped on site '{site}'"))),
    }
}
