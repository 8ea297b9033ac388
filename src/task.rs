// 该文件是 Maskterial 项目的一部分。
// src/task.rs - 数据集推理任务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::time::{Duration, Instant};

use chrono::TimeDelta;
use tracing::{info, warn};

use crate::{
  catalog::{DatasetCatalog, DatasetRecord},
  eval::{EvalResults, IouType},
  evaluator::{DatasetEvaluator, FlakeCocoEvaluatorBuilder},
  model::{Model, ModelOutput},
};

/// 预热后平均推理时间超过该值时立即开始报告进度
const SLOW_COMPUTE_SECS: f64 = 5.0;
const MAX_WARMUP: usize = 5;

pub trait Task<I, M, E>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, evaluator: E) -> Result<Self::Output, Self::Error>;
}

/// 在固定长度的数据上逐批推理并交给评估器。
///
/// 前 `num_warmup` 个批次不计入耗时统计。预计剩余时间超过 `max_time` 时提前停止并返回 `None`。
#[derive(Debug, Default, Clone)]
pub struct InferenceOnDataset {
  max_time: Option<Duration>,
  num_warmup: Option<usize>,
}

impl InferenceOnDataset {
  pub fn with_max_time(mut self, max_time: Option<Duration>) -> Self {
    self.max_time = max_time;
    self
  }

  /// 缺省为 `min(5, total - 1)`
  pub fn with_num_warmup(mut self, num_warmup: Option<usize>) -> Self {
    self.num_warmup = num_warmup;
    self
  }
}

impl<
  B,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  EE: std::error::Error + Sync + Send + 'static,
  I: ExactSizeIterator<Item = B>,
  M: Model<Input = B, Output = D, Error = ME>,
  E: DatasetEvaluator<B, D, Error = EE>,
> Task<I, M, E> for InferenceOnDataset
{
  type Output = Option<EvalResults>;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, mut evaluator: E) -> Result<Self::Output, Self::Error> {
    let total = input.len();
    info!("开始在 {} 个批次上推理", total);
    evaluator.reset();

    let num_warmup = self
      .num_warmup
      .unwrap_or_else(|| MAX_WARMUP.min(total.saturating_sub(1)));
    let mut start_time = Instant::now();
    let mut total_data_time = Duration::ZERO;
    let mut total_compute_time = Duration::ZERO;
    let mut total_eval_time = Duration::ZERO;

    let mut start_data_time = Instant::now();
    for (idx, inputs) in input.enumerate() {
      total_data_time += start_data_time.elapsed();
      if idx == num_warmup {
        start_time = Instant::now();
        total_data_time = Duration::ZERO;
        total_compute_time = Duration::ZERO;
        total_eval_time = Duration::ZERO;
      }

      let start_compute_time = Instant::now();
      let outputs = model.infer(&inputs)?;
      total_compute_time += start_compute_time.elapsed();

      let start_eval_time = Instant::now();
      evaluator.process(&inputs, &outputs)?;
      total_eval_time += start_eval_time.elapsed();

      let iters_after_start = (idx + 1 - if idx >= num_warmup { num_warmup } else { 0 }) as f64;
      let data_seconds_per_iter = total_data_time.as_secs_f64() / iters_after_start;
      let compute_seconds_per_iter = total_compute_time.as_secs_f64() / iters_after_start;
      let eval_seconds_per_iter = total_eval_time.as_secs_f64() / iters_after_start;
      let total_seconds_per_iter = start_time.elapsed().as_secs_f64() / iters_after_start;

      if idx >= num_warmup * 2 || compute_seconds_per_iter > SLOW_COMPUTE_SECS {
        let eta_secs = (total_seconds_per_iter * (total - idx - 1) as f64) as i64;
        let eta = TimeDelta::try_seconds(eta_secs).unwrap_or_default();
        info!(
          "推理完成 {}/{}. 数据加载: {:.4} s/iter. 推理: {:.4} s/iter. 评估: {:.4} s/iter. 总计: {:.4} s/iter. ETA={}",
          idx + 1,
          total,
          data_seconds_per_iter,
          compute_seconds_per_iter,
          eval_seconds_per_iter,
          total_seconds_per_iter,
          format_timedelta(eta)
        );

        let over_budget = self
          .max_time
          .filter(|max_time| eta_secs as f64 > max_time.as_secs_f64());
        if let Some(max_time) = over_budget {
          warn!(
            "预计剩余时间 {} 超过限制 {}, 停止评估并报告失败",
            format_timedelta(eta),
            format_timedelta(TimeDelta::from_std(max_time).unwrap_or_default())
          );
          return Ok(None);
        }
      }
      start_data_time = Instant::now();
    }

    let measured = total.saturating_sub(num_warmup).max(1) as f64;
    let total_time = start_time.elapsed();
    info!(
      "总推理时间: {} ({:.6} s / iter)",
      format_timedelta(TimeDelta::from_std(total_time).unwrap_or_default()),
      total_time.as_secs_f64() / measured
    );
    info!(
      "纯推理计算时间: {} ({:.6} s / iter)",
      format_timedelta(TimeDelta::try_seconds(total_compute_time.as_secs() as i64).unwrap_or_default()),
      total_compute_time.as_secs_f64() / measured
    );

    Ok(Some(evaluator.evaluate()?))
  }
}

/// 格式化为 `H:MM:SS`，超过一天时带天数前缀，有小数秒时追加微秒
pub fn format_timedelta(delta: TimeDelta) -> String {
  let days = delta.num_days();
  let hours = delta.num_hours() % 24;
  let minutes = delta.num_minutes() % 60;
  let seconds = delta.num_seconds() % 60;
  let micros = delta.subsec_nanos() / 1000;

  let mut s = format!("{}:{:02}:{:02}", hours, minutes, seconds);
  if micros > 0 {
    s.push_str(&format!(".{:06}", micros));
  }
  match days {
    0 => s,
    1 => format!("1 day, {}", s),
    d => format!("{} days, {}", d, s),
  }
}

/// 以单张图像为批次在注册的数据集上推理并评估 `segm`
pub fn evaluate_on_dataset<M>(
  catalog: &DatasetCatalog,
  dataset_name: &str,
  model: M,
  max_time: Option<Duration>,
) -> anyhow::Result<Option<EvalResults>>
where
  M: Model<Input = Vec<DatasetRecord>, Output = Vec<ModelOutput>>,
  M::Error: std::error::Error + Sync + Send + 'static,
{
  let records = catalog.records(dataset_name)?;
  let evaluator = FlakeCocoEvaluatorBuilder::new(dataset_name)
    .tasks(vec![IouType::Segm])
    .distributed(false)
    .build(catalog)?;

  let batches = records.iter().map(|record| vec![record.clone()]);
  InferenceOnDataset::default()
    .with_max_time(max_time)
    .run_task(batches, model, evaluator)
}
