// 该文件是 Maskterial 项目的一部分。
// src/comm.rs - 多进程汇总
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

use tracing::debug;

/// 进程间的屏障与汇总
pub trait Communicator<T> {
  fn world_size(&self) -> usize;

  fn rank(&self) -> usize;

  fn is_main_process(&self) -> bool {
    self.rank() == 0
  }

  /// 等待所有进程到达
  fn synchronize(&self);

  /// 将各进程的数据收集到 `dst`，其他进程得到空列表
  fn gather(&self, data: T, dst: usize) -> Vec<T>;
}

/// 单进程实现
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommunicator;

impl<T> Communicator<T> for LocalCommunicator {
  fn world_size(&self) -> usize {
    1
  }

  fn rank(&self) -> usize {
    0
  }

  fn synchronize(&self) {
    debug!("单进程运行, 跳过同步");
  }

  fn gather(&self, data: T, dst: usize) -> Vec<T> {
    if dst == 0 { vec![data] } else { Vec::new() }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn local_gather_returns_own_data() {
    let comm = LocalCommunicator;
    assert!(Communicator::<Vec<u8>>::is_main_process(&comm));
    assert_eq!(comm.gather(vec![1u8, 2], 0), vec![vec![1, 2]]);
    assert!(comm.gather(vec![1u8], 1).is_empty());
  }
}
