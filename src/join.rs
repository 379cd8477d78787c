// Assign dots to the nuclei that contain them.

use rayon::prelude::*;

use crate::dots::{Dot, DotTable};
use crate::nuclei::{NucleusCatalog, NucleusId};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct JoinedDot {
    pub dot: Dot,
    // None when the dot lies outside every nucleus.
    pub nucleus_id: Option<NucleusId>,
    // The configured dot channel this dot was detected in.
    pub channel: u32,
}

// Row order of an image's joined dots across all of its channels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RowOrder {
    // Unassigned dots last, then by nucleus id, then by channel. The sort is
    // stable, so dots of one nucleus and channel keep their detector order.
    #[default]
    GroupByNucleus,
    // Channels in configured order, each in detector order.
    InputOrder,
}

/// First nucleus in catalog order containing the dot. When polygons overlap
/// the earlier nucleus wins, regardless of which region is smaller.
pub fn assign_nucleus(catalog: &NucleusCatalog, dot: &Dot) -> Option<NucleusId> {
    catalog.first_containing(dot.coords()).map(|n| n.id)
}

/// Join one channel's dots against one image's catalog. The output has one
/// row per input dot, in input order.
pub fn join_channel(catalog: &NucleusCatalog, dots: &DotTable, channel: u32) -> Vec<JoinedDot> {
    dots.as_slice()
        .par_iter()
        .map(|dot| JoinedDot {
            dot: *dot,
            nucleus_id: assign_nucleus(catalog, dot),
            channel,
        })
        .collect()
}

pub fn join_image(catalog: &NucleusCatalog, tables: &[(u32, DotTable)], order: RowOrder) -> Vec<JoinedDot> {
    let mut rows: Vec<JoinedDot> = tables
        .iter()
        .flat_map(|(channel, dots)| join_channel(catalog, dots, *channel))
        .collect();

    if order == RowOrder::GroupByNucleus {
        sort_by_nucleus(&mut rows);
    }

    rows
}

pub fn sort_by_nucleus(rows: &mut [JoinedDot]) {
    rows.sort_by_key(|row| (row.nucleus_id.is_none(), row.nucleus_id, row.channel));
}
