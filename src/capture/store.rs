//! 捕获日志持久化存储
//!
//! 追加式 JSONL 文件，单写者串行化，读取时短暂排斥写入

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use super::model::{CaptureRequest, CaptureResponse, LogEntry, Pair};

/// 日志文件名（相对数据目录）
const LOG_FILE_NAME: &str = "messages.jsonl";

/// 底层 JSONL 存储（同步）
struct LogStore {
    path: PathBuf,
    /// 惰性打开的追加句柄；clear 后置空，下次追加重建文件
    file: Mutex<Option<File>>,
}

impl LogStore {
    fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("创建数据目录失败: {}", data_dir.display()))?;
        Ok(Self {
            path: data_dir.join(LOG_FILE_NAME),
            file: Mutex::new(None),
        })
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("序列化日志行失败")?;

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("打开日志文件失败: {}", self.path.display()))?;
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("句柄已在上方填充");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// 按文件顺序读取全部记录，无法解析的行（如尾部截断写入）跳过
    fn read_all(&self) -> Vec<LogEntry> {
        let _guard = self.file.lock().unwrap_or_else(|e| e.into_inner());

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => continue,
            }
        }
        entries
    }

    fn get_pairs(&self) -> Vec<Pair> {
        let mut requests: Vec<CaptureRequest> = Vec::new();
        let mut responses: HashMap<String, CaptureResponse> = HashMap::new();

        for entry in self.read_all() {
            match entry {
                LogEntry::Request { data, .. } => requests.push(data),
                // 同一 id 多条响应时（不变式禁止但被容忍），后者覆盖前者
                LogEntry::Response { data, .. } => {
                    responses.insert(data.request_id.clone(), data);
                }
            }
        }

        requests
            .into_iter()
            .map(|request| {
                let response = responses.remove(&request.id);
                Pair { request, response }
            })
            .collect()
    }

    /// 关闭句柄并删除文件；持有同一把锁，会排空正在进行的写入
    fn clear(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除日志文件失败: {}", self.path.display())),
        }
    }
}

/// 异步捕获日志（公开 API）
///
/// 文件 I/O 通过 spawn_blocking 执行，不阻塞运行时
pub struct CaptureLog {
    store: Arc<LogStore>,
}

impl CaptureLog {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: Arc::new(LogStore::new(data_dir.as_ref())?),
        })
    }

    /// 日志文件路径
    pub fn path(&self) -> &Path {
        &self.store.path
    }

    /// 追加一条请求记录
    pub async fn log_request(&self, request: &CaptureRequest) -> Result<()> {
        self.append(LogEntry::request(request.clone())).await
    }

    /// 追加一条响应记录
    pub async fn log_response(&self, response: &CaptureResponse) -> Result<()> {
        self.append(LogEntry::response(response.clone())).await
    }

    async fn append(&self, entry: LogEntry) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.append(&entry)).await?
    }

    /// 读取全部记录；读失败返回空
    pub async fn read_all(&self) -> Vec<LogEntry> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.read_all())
            .await
            .unwrap_or_default()
    }

    /// 按请求写入顺序返回配对结果
    pub async fn get_pairs(&self) -> Vec<Pair> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_pairs())
            .await
            .unwrap_or_default()
    }

    /// 清空日志
    pub async fn clear(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(model: &str) -> CaptureRequest {
        CaptureRequest::from_body(
            format!(r#"{{"model":"{}","messages":[{{"role":"user","content":"hi"}}]}}"#, model)
                .as_bytes(),
        )
    }

    fn sample_response(request_id: &str, stop: &str) -> CaptureResponse {
        CaptureResponse {
            request_id: request_id.to_string(),
            timestamp: super::super::model::now_iso(),
            duration_ms: 10,
            model: "m".to_string(),
            content: Vec::new(),
            stop_reason: Some(stop.to_string()),
            usage: Default::default(),
        }
    }

    /// 测试追加后按序读回
    #[tokio::test]
    async fn test_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();

        let r1 = sample_request("m1");
        let r2 = sample_request("m2");
        log.log_request(&r1).await.unwrap();
        log.log_request(&r2).await.unwrap();

        let entries = log.read_all().await;
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            LogEntry::Request { data, .. } => assert_eq!(data.model, "m1"),
            other => panic!("第一条应该是请求，实际是 {:?}", other),
        }
    }

    /// 测试尾部截断行被跳过，之前的记录完好
    #[tokio::test]
    async fn test_truncated_tail_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();

        log.log_request(&sample_request("m1")).await.unwrap();

        // 模拟崩溃留下的半行
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(log.path())
                .unwrap();
            file.write_all(b"{\"type\":\"request\",\"time").unwrap();
        }

        let entries = log.read_all().await;
        assert_eq!(entries.len(), 1);
    }

    /// 测试配对：按请求写入顺序，缺响应的为 null
    #[tokio::test]
    async fn test_get_pairs_order_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();

        let r1 = sample_request("m1");
        let r2 = sample_request("m2");
        log.log_request(&r1).await.unwrap();
        log.log_request(&r2).await.unwrap();
        log.log_response(&sample_response(&r1.id, "end_turn")).await.unwrap();

        let pairs = log.get_pairs().await;
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].request.id, r1.id);
        assert!(pairs[0].response.is_some());
        assert_eq!(pairs[1].request.id, r2.id);
        assert!(pairs[1].response.is_none());
    }

    /// 测试同一 id 多条响应时后者生效
    #[tokio::test]
    async fn test_duplicate_response_last_wins() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();

        let r1 = sample_request("m1");
        log.log_request(&r1).await.unwrap();
        log.log_response(&sample_response(&r1.id, "first")).await.unwrap();
        log.log_response(&sample_response(&r1.id, "second")).await.unwrap();

        let pairs = log.get_pairs().await;
        let resp = pairs[0].response.as_ref().expect("应该有响应");
        assert_eq!(resp.stop_reason.as_deref(), Some("second"));
    }

    /// 测试配对查询幂等：无写入时两次结果一致
    #[tokio::test]
    async fn test_get_pairs_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();

        let r1 = sample_request("m1");
        log.log_request(&r1).await.unwrap();
        log.log_response(&sample_response(&r1.id, "end_turn")).await.unwrap();

        let first = serde_json::to_value(log.get_pairs().await).unwrap();
        let second = serde_json::to_value(log.get_pairs().await).unwrap();
        assert_eq!(first, second);
    }

    /// 测试 clear 后读取为空，再次追加重建文件
    #[tokio::test]
    async fn test_clear_then_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();

        log.log_request(&sample_request("m1")).await.unwrap();
        log.clear().await.unwrap();
        assert!(log.read_all().await.is_empty());
        assert!(!log.path().exists());

        log.log_request(&sample_request("m2")).await.unwrap();
        assert!(log.path().exists());
        assert_eq!(log.read_all().await.len(), 1);
    }

    /// 测试重复 clear 不报错
    #[tokio::test]
    async fn test_clear_twice_ok() {
        let dir = tempfile::tempdir().unwrap();
        let log = CaptureLog::new(dir.path()).unwrap();
        log.clear().await.unwrap();
        log.clear().await.unwrap();
    }
}
