// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/cache.rs - 检测结果缓存
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

//! 以像素内容为键的检测结果缓存。
//!
//! 命中检查、插入与淘汰在同一把锁内完成；同一内容的并发请求只会触发一次推理，
//! 其余请求等待首个请求的结果。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use crate::executor::InferenceError;
use crate::frame::DecodedImage;
use crate::model::DetectionSet;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// 像素内容指纹
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
  pub fn of(image: &DecodedImage) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_hwc());
    Self(hasher.finalize().into())
  }

  pub fn to_hex(&self) -> String {
    self.0.iter().map(|b| format!("{:02x}", b)).collect()
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in &self.0[..8] {
      write!(f, "{:02x}", b)?;
    }
    Ok(())
  }
}

impl fmt::Debug for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheKey({})", self)
  }
}

type Flight = Option<Result<Arc<DetectionSet>, InferenceError>>;

#[derive(Default)]
struct Inner {
  entries: HashMap<CacheKey, Arc<DetectionSet>>,
  order: VecDeque<CacheKey>,
  inflight: HashMap<CacheKey, watch::Sender<Flight>>,
}

impl Inner {
  fn touch(&mut self, key: &CacheKey) {
    if let Some(pos) = self.order.iter().position(|k| k == key) {
      self.order.remove(pos);
    }
    self.order.push_back(*key);
  }

  fn insert(&mut self, capacity: usize, key: CacheKey, value: Arc<DetectionSet>) {
    if capacity == 0 {
      return;
    }
    if self.entries.contains_key(&key) {
      self.entries.insert(key, value);
      self.touch(&key);
      return;
    }
    // 先淘汰，后插入
    while self.entries.len() >= capacity {
      let Some(oldest) = self.order.pop_front() else {
        break;
      };
      self.entries.remove(&oldest);
      debug!("淘汰缓存条目: {}", oldest);
    }
    self.entries.insert(key, value);
    self.order.push_back(key);
  }
}

/// 查询结果
pub enum Lookup<'a> {
  /// 已缓存
  Hit(Arc<DetectionSet>),
  /// 相同内容正在推理，等待其结果
  Wait(watch::Receiver<Flight>),
  /// 由当前请求负责推理
  Lead(FlightGuard<'a>),
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
  Cache,
  Coalesced,
  Inferred,
}

#[derive(Debug, Clone)]
pub struct Resolved {
  pub detections: Arc<DetectionSet>,
  pub source: ResultSource,
}

impl Resolved {
  /// 当前请求没有调用检测器
  pub fn is_cache_hit(&self) -> bool {
    self.source != ResultSource::Inferred
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub capacity: usize,
  pub hits: u64,
  pub misses: u64,
}

/// 容量受限的 LRU 缓存
pub struct ResultCache {
  capacity: usize,
  inner: Mutex<Inner>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl Default for ResultCache {
  fn default() -> Self {
    Self::new(DEFAULT_CACHE_CAPACITY)
  }
}

impl ResultCache {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      inner: Mutex::new(Inner::default()),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      entries: self.len(),
      capacity: self.capacity,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
    }
  }

  pub fn get(&self, key: &CacheKey) -> Option<Arc<DetectionSet>> {
    let mut inner = self.lock();
    let value = inner.entries.get(key).cloned()?;
    inner.touch(key);
    Some(value)
  }

  pub fn put(&self, key: CacheKey, value: Arc<DetectionSet>) {
    self.lock().insert(self.capacity, key, value);
  }

  pub fn lookup(&self, key: &CacheKey) -> Lookup<'_> {
    let mut inner = self.lock();
    if let Some(value) = inner.entries.get(key).cloned() {
      inner.touch(key);
      return Lookup::Hit(value);
    }
    if let Some(sender) = inner.inflight.get(key) {
      return Lookup::Wait(sender.subscribe());
    }
    let (sender, _) = watch::channel(None);
    inner.inflight.insert(*key, sender);
    Lookup::Lead(FlightGuard {
      cache: self,
      key: *key,
      finished: false,
    })
  }

  /// 取缓存结果，未命中时调用 `compute` 并写入缓存
  ///
  /// 相同键的并发调用只有一个会执行 `compute`。负责推理的请求被取消时，
  /// 等待者会重新查询，其中之一接手推理。
  pub async fn resolve<F, Fut>(&self, key: CacheKey, compute: F) -> Result<Resolved, InferenceError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<DetectionSet, InferenceError>>,
  {
    let mut compute = Some(compute);
    loop {
      match self.lookup(&key) {
        Lookup::Hit(detections) => {
          self.hits.fetch_add(1, Ordering::Relaxed);
          debug!("缓存命中: {}", key);
          return Ok(Resolved {
            detections,
            source: ResultSource::Cache,
          });
        }
        Lookup::Wait(mut receiver) => {
          debug!("等待相同内容的推理结果: {}", key);
          let outcome = receiver.wait_for(Option::is_some).await.map(|v| v.clone());
          match outcome {
            Ok(Some(Ok(detections))) => {
              self.hits.fetch_add(1, Ordering::Relaxed);
              return Ok(Resolved {
                detections,
                source: ResultSource::Coalesced,
              });
            }
            Ok(Some(Err(e))) => return Err(e),
            // 负责推理的请求已放弃
            Ok(None) | Err(_) => continue,
          }
        }
        Lookup::Lead(guard) => {
          let Some(compute) = compute.take() else {
            return Err(InferenceError::Aborted("重复的推理请求".to_string()));
          };
          self.misses.fetch_add(1, Ordering::Relaxed);
          debug!("缓存未命中: {}", key);
          let result = compute().await.map(Arc::new);
          guard.complete(result.clone());
          return result.map(|detections| Resolved {
            detections,
            source: ResultSource::Inferred,
          });
        }
      }
    }
  }
}

/// 进行中的推理登记，丢弃前未完成时撤销登记
pub struct FlightGuard<'a> {
  cache: &'a ResultCache,
  key: CacheKey,
  finished: bool,
}

impl FlightGuard<'_> {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// 成功时写入缓存，然后把结果分发给等待者
  pub fn complete(mut self, result: Result<Arc<DetectionSet>, InferenceError>) {
    let mut inner = self.cache.lock();
    if let Ok(value) = &result {
      inner.insert(self.cache.capacity, self.key, value.clone());
    }
    if let Some(sender) = inner.inflight.remove(&self.key) {
      sender.send_replace(Some(result));
    }
    self.finished = true;
  }
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    if !self.finished {
      debug!("推理登记被撤销: {}", self.key);
      self.cache.lock().inflight.remove(&self.key);
    }
  }
}
