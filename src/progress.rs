use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::DownloadInfo;

/// Receives transfer progress. `total` is `None` when the size is unknown.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, transferred: u64, total: Option<u64>);
}

impl<F> ProgressListener for F
where
    F: Fn(u64, Option<u64>) + Send + Sync,
{
    fn on_progress(&self, transferred: u64, total: Option<u64>) {
        self(transferred, total)
    }
}

/// Called once the download response headers are known, before body bytes flow.
pub trait DownloadStartListener: Send + Sync {
    fn on_start(&self, info: &DownloadInfo);
}

impl<F> DownloadStartListener for F
where
    F: Fn(&DownloadInfo) + Send + Sync,
{
    fn on_start(&self, info: &DownloadInfo) {
        self(info)
    }
}

/// Reports the running byte count of `stream` as chunks pass through.
pub(crate) fn report_progress<S>(
    stream: S,
    listener: Option<Arc<dyn ProgressListener>>,
    total: Option<u64>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let mut transferred = 0u64;
    stream.inspect(move |chunk| {
        if let (Ok(bytes), Some(listener)) = (chunk, &listener) {
            transferred += bytes.len() as u64;
            listener.on_progress(transferred, total);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::{report_progress, ProgressListener};

    #[tokio::test]
    async fn reports_running_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn ProgressListener> =
            Arc::new(move |done: u64, total: Option<u64>| sink.lock().push((done, total)));

        let chunks = futures::stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"de")),
        ]);
        let collected: Vec<_> = report_progress(chunks, Some(listener), Some(5))
            .collect()
            .await;

        assert_eq!(collected.len(), 2);
        assert_eq!(*seen.lock(), vec![(3, Some(5)), (5, Some(5))]);
    }
}
