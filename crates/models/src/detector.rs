use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{relu, sigmoid, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use crate::outputs::{LossOutputs, LossTerm, ACCURACY_KEY};

/// Number of feature levels (stem resolution and one stride-2 level).
const NUM_LEVELS: usize = 2;

#[derive(Debug, Clone)]
pub struct ConvolutionalDetectorConfig {
    pub hidden: usize,
    /// Number of classes including background (class 0).
    pub num_classes: usize,
    pub max_boxes: usize,
}

impl Default for ConvolutionalDetectorConfig {
    fn default() -> Self {
        Self {
            hidden: 16,
            num_classes: 2,
            max_boxes: 8,
        }
    }
}

/// Ground truth padded to `max_boxes` slots per image.
#[derive(Debug, Clone)]
pub struct DetectionTargets<B: Backend> {
    /// Normalized boxes, shape [batch, max_boxes, 4].
    pub boxes: Tensor<B, 3>,
    /// 1.0 on the 4 coordinates of populated slots, shape [batch, max_boxes, 4].
    pub box_weights: Tensor<B, 3>,
    /// Class id per slot (0 = background), shape [batch, max_boxes].
    pub labels: Tensor<B, 2, Int>,
}

impl<B: Backend> DetectionTargets<B> {
    /// Pack per-image `(box, class_id)` lists into padded slot tensors.
    /// Objects beyond `max_boxes` are dropped.
    pub fn from_objects(
        objects: &[Vec<([f32; 4], u32)>],
        max_boxes: usize,
        device: &B::Device,
    ) -> Self {
        let batch = objects.len();
        let max_boxes = max_boxes.max(1);
        let mut boxes = vec![0.0f32; batch * max_boxes * 4];
        let mut weights = vec![0.0f32; batch * max_boxes * 4];
        let mut labels = vec![0i64; batch * max_boxes];
        for (b, image_objects) in objects.iter().enumerate() {
            for (slot, (bbox, class_id)) in image_objects.iter().take(max_boxes).enumerate() {
                let base = (b * max_boxes + slot) * 4;
                boxes[base..base + 4].copy_from_slice(bbox);
                weights[base..base + 4].copy_from_slice(&[1.0; 4]);
                labels[b * max_boxes + slot] = *class_id as i64;
            }
        }
        Self {
            boxes: Tensor::from_data(TensorData::new(boxes, [batch, max_boxes, 4]), device),
            box_weights: Tensor::from_data(TensorData::new(weights, [batch, max_boxes, 4]), device),
            labels: Tensor::from_data(TensorData::new(labels, [batch, max_boxes]), device),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.boxes.dims()[0]
    }
}

/// Raw head outputs before any loss or decoding.
#[derive(Debug, Clone)]
pub struct DetectorHeads<B: Backend> {
    /// Class logits per slot, shape [batch, max_boxes, num_classes].
    pub cls_logits: Tensor<B, 3>,
    /// Sigmoid boxes per level, each [batch, max_boxes, 4].
    pub level_boxes: Vec<Tensor<B, 3>>,
}

#[derive(Debug, Module)]
pub struct ConvolutionalDetector<B: Backend> {
    stem: Conv2d<B>,
    down: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    cls_head: nn::Linear<B>,
    box_heads: Vec<nn::Linear<B>>,
    max_boxes: usize,
    num_classes: usize,
}

impl<B: Backend> ConvolutionalDetector<B> {
    pub fn new(cfg: ConvolutionalDetectorConfig, device: &B::Device) -> Self {
        let hidden = cfg.hidden.max(1);
        let max_boxes = cfg.max_boxes.max(1);
        let num_classes = cfg.num_classes.max(2);
        let stem = Conv2dConfig::new([3, hidden], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let down = Conv2dConfig::new([hidden, hidden], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let cls_head =
            nn::LinearConfig::new(hidden * NUM_LEVELS, max_boxes * num_classes).init(device);
        let box_heads = (0..NUM_LEVELS)
            .map(|_| nn::LinearConfig::new(hidden, max_boxes * 4).init(device))
            .collect();
        Self {
            stem,
            down,
            pool,
            cls_head,
            box_heads,
            max_boxes,
            num_classes,
        }
    }

    pub fn max_boxes(&self) -> usize {
        self.max_boxes
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Pooled feature vector per level, each [batch, hidden].
    fn forward_levels(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 2>> {
        let c1 = relu(self.stem.forward(images));
        let c2 = relu(self.down.forward(c1.clone()));
        [c1, c2]
            .into_iter()
            .map(|feat| {
                let pooled = self.pool.forward(feat);
                let [batch, channels, _, _] = pooled.dims();
                pooled.reshape([batch, channels])
            })
            .collect()
    }

    pub fn forward_heads(&self, images: Tensor<B, 4>) -> DetectorHeads<B> {
        let levels = self.forward_levels(images);
        let batch = levels[0].dims()[0];
        let joined = Tensor::cat(levels.clone(), 1);
        let cls_logits = self
            .cls_head
            .forward(joined)
            .reshape([batch, self.max_boxes, self.num_classes]);
        let level_boxes = self
            .box_heads
            .iter()
            .zip(levels)
            .map(|(head, feat)| sigmoid(head.forward(feat)).reshape([batch, self.max_boxes, 4]))
            .collect();
        DetectorHeads {
            cls_logits,
            level_boxes,
        }
    }

    /// Loss mode: `loss_cls`, `acc` (percent of slots classified correctly,
    /// detached) and `loss_bbox` (one masked L1 term per level), in that order.
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: &DetectionTargets<B>,
    ) -> LossOutputs<B> {
        let heads = self.forward_heads(images);
        let [batch, slots, classes] = heads.cls_logits.dims();
        let logits = heads.cls_logits.reshape([batch * slots, classes]);
        let labels = targets.labels.clone().reshape([batch * slots]);

        let loss_cls = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), labels.clone());
        let acc = slot_accuracy(logits, labels);

        // Matched coordinates / 4 = matched slots; clamp so empty images give zero loss.
        let matched = targets.box_weights.clone().sum().div_scalar(4.0).clamp_min(1.0);
        let loss_bbox = heads
            .level_boxes
            .into_iter()
            .map(|pred| {
                ((pred - targets.boxes.clone()).abs() * targets.box_weights.clone()).sum()
                    / matched.clone()
            })
            .collect();

        LossOutputs::new()
            .with("loss_cls", LossTerm::Single(loss_cls))
            .with(ACCURACY_KEY, LossTerm::Single(acc))
            .with("loss_bbox", LossTerm::List(loss_bbox))
    }

    /// Inference mode: boxes averaged over levels [batch, max_boxes, 4], best
    /// foreground probability per slot [batch, max_boxes], and its class id.
    pub fn forward_detect(
        &self,
        images: Tensor<B, 4>,
    ) -> (Tensor<B, 3>, Tensor<B, 2>, Tensor<B, 2, Int>) {
        let heads = self.forward_heads(images);
        let [batch, slots, classes] = heads.cls_logits.dims();
        let device = heads.cls_logits.device();
        let levels = heads.level_boxes.len().max(1) as f32;
        let boxes = heads
            .level_boxes
            .into_iter()
            .reduce(|acc, b| acc + b)
            .map(|sum| sum.div_scalar(levels))
            .unwrap_or_else(|| Tensor::zeros([batch, slots, 4], &device));

        let probs = softmax(heads.cls_logits, 2);
        let foreground = probs.slice([0..batch, 0..slots, 1..classes]);
        let scores = foreground.clone().max_dim(2).reshape([batch, slots]);
        let class_ids = foreground.argmax(2).reshape([batch, slots]).add_scalar(1);
        (boxes, scores, class_ids)
    }
}

fn slot_accuracy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let n = labels.dims()[0];
    let predicted = logits.detach().argmax(1).reshape([n]);
    predicted.equal(labels).float().mean().mul_scalar(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::scalar_f32;
    use burn::backend::{ndarray::NdArray, Autodiff};

    type ADBackend = Autodiff<NdArray<f32>>;

    fn tiny() -> (ConvolutionalDetector<ADBackend>, DetectionTargets<ADBackend>) {
        let device = Default::default();
        let model = ConvolutionalDetector::new(
            ConvolutionalDetectorConfig {
                hidden: 4,
                num_classes: 3,
                max_boxes: 2,
            },
            &device,
        );
        let targets = DetectionTargets::from_objects(
            &[vec![([0.1, 0.1, 0.5, 0.5], 2)]],
            2,
            &device,
        );
        (model, targets)
    }

    #[test]
    fn loss_outputs_have_expected_entries() {
        let (model, targets) = tiny();
        let images = Tensor::<ADBackend, 4>::ones([1, 3, 8, 8], &Default::default());
        let outputs = model.forward_loss(images, &targets);
        assert_eq!(
            outputs.names().collect::<Vec<_>>(),
            vec!["loss_cls", "acc", "loss_bbox"]
        );
        match outputs.get("loss_bbox") {
            Some(LossTerm::List(terms)) => assert_eq!(terms.len(), NUM_LEVELS),
            other => panic!("unexpected loss_bbox: {other:?}"),
        }
        let acc = outputs.accuracy().unwrap().expect("acc");
        assert!((0.0..=100.0).contains(&acc));
        assert!(scalar_f32(outputs.objective().expect("objective"))
            .unwrap()
            .is_finite());
    }

    #[test]
    fn objective_gradient_reaches_input() {
        let (model, targets) = tiny();
        let images = Tensor::<ADBackend, 4>::ones([1, 3, 8, 8], &Default::default()).require_grad();
        let outputs = model.forward_loss(images.clone(), &targets);
        let grads = outputs.objective().expect("objective").backward();
        let grad = images.grad(&grads).expect("image gradient");
        assert_eq!(grad.dims(), [1, 3, 8, 8]);
    }

    #[test]
    fn targets_pad_and_truncate() {
        let device = Default::default();
        let targets = DetectionTargets::<NdArray<f32>>::from_objects(
            &[
                vec![([0.0, 0.0, 1.0, 1.0], 1); 3],
                Vec::new(),
            ],
            2,
            &device,
        );
        assert_eq!(targets.boxes.dims(), [2, 2, 4]);
        let labels = targets.labels.into_data().to_vec::<i64>().unwrap_or_default();
        assert_eq!(labels, vec![1, 1, 0, 0]);
        let weights = targets.box_weights.sum();
        assert_eq!(scalar_f32(weights).unwrap(), 8.0);
    }

    #[test]
    fn detect_shapes_and_class_range() {
        let device = Default::default();
        let model = ConvolutionalDetector::<NdArray<f32>>::new(
            ConvolutionalDetectorConfig {
                hidden: 4,
                num_classes: 3,
                max_boxes: 5,
            },
            &device,
        );
        let (boxes, scores, classes) =
            model.forward_detect(Tensor::zeros([2, 3, 6, 6], &device));
        assert_eq!(boxes.dims(), [2, 5, 4]);
        assert_eq!(scores.dims(), [2, 5]);
        let classes = classes.into_data().to_vec::<i64>().unwrap_or_default();
        assert!(classes.iter().all(|c| (1..3).contains(c)));
    }
}
