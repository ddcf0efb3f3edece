//! History page DTOs

use serde::{Deserialize, Serialize};

use crate::domain::name::PipelineName;
use crate::domain::pipeline::PipelineInstance;
use crate::domain::stage::StageInstance;

/// Offset-based paging window plus the total it was cut from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub page_size: usize,
    pub total: usize,
}

impl Pagination {
    pub fn new(offset: usize, page_size: usize, total: usize) -> Self {
        Self {
            offset,
            page_size,
            total,
        }
    }

    /// 1-based page number containing `offset`
    pub fn current_page(&self) -> usize {
        if self.page_size == 0 {
            return 1;
        }
        self.offset / self.page_size + 1
    }

    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size)
    }

    pub fn has_next(&self) -> bool {
        self.offset.saturating_add(self.page_size) < self.total
    }

    pub fn has_previous(&self) -> bool {
        self.offset > 0
    }
}

/// One page of runs of a stage, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub pipeline_name: PipelineName,
    pub stage_name: String,
    pub pagination: Pagination,
    pub stages: Vec<StageInstance>,
}

/// One page of pipeline instances, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineHistoryPage {
    pub pipeline_name: PipelineName,
    pub pagination: Pagination,
    pub pipelines: Vec<PipelineInstance>,
}
