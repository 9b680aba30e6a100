use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::activation::sigmoid,
};

// #[derive(Config)] generates Clone and Serialize/Deserialize itself;
// deriving them again gives conflicting impls.
#[derive(Config, Debug)]
pub struct UNetConfig {
    pub in_channels:   usize,
    pub out_channels:  usize,
    /// Channels of the first encoder level; doubled at every level down
    #[config(default = 32)]
    pub base_channels: usize,
    /// Number of 2x2 pooling steps
    #[config(default = 4)]
    pub depth:         usize,
}

impl UNetConfig {
    /// Slice height and width must be multiples of this.
    pub fn required_divisor(&self) -> usize {
        1 << self.depth
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        let ch = |level: usize| self.base_channels << level;

        let encoders: Vec<ConvBlock<B>> = (0..self.depth)
            .map(|level| {
                let input = if level == 0 { self.in_channels } else { ch(level - 1) };
                conv_block(input, ch(level), device)
            })
            .collect();
        let bottleneck = conv_block(
            if self.depth == 0 { self.in_channels } else { ch(self.depth - 1) },
            ch(self.depth),
            device,
        );

        // Decoder levels are stored deepest first, the order forward() runs them.
        let upsamplers: Vec<ConvTranspose2d<B>> = (0..self.depth)
            .rev()
            .map(|level| {
                ConvTranspose2dConfig::new([ch(level + 1), ch(level)], [2, 2])
                    .with_stride([2, 2])
                    .init(device)
            })
            .collect();
        let decoders: Vec<ConvBlock<B>> = (0..self.depth)
            .rev()
            .map(|level| conv_block(ch(level + 1), ch(level), device))
            .collect();

        let head = Conv2dConfig::new([ch(0), self.out_channels], [1, 1]).init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        UNet { encoders, pool, bottleneck, upsamplers, decoders, head }
    }
}

fn conv_block<B: Backend>(input: usize, output: usize, device: &B::Device) -> ConvBlock<B> {
    let conv = |i, o| {
        Conv2dConfig::new([i, o], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device)
    };
    ConvBlock {
        conv1:      conv(input, output),
        norm1:      BatchNormConfig::new(output).init(device),
        conv2:      conv(output, output),
        norm2:      BatchNormConfig::new(output).init(device),
        activation: Relu::new(),
    }
}

/// conv3x3 → BN → ReLU → conv3x3 → BN → ReLU, spatial size preserved.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv1:      Conv2d<B>,
    pub norm1:      BatchNorm<B, 2>,
    pub conv2:      Conv2d<B>,
    pub norm2:      BatchNorm<B, 2>,
    pub activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.norm1.forward(self.conv1.forward(x)));
        self.activation.forward(self.norm2.forward(self.conv2.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub encoders:   Vec<ConvBlock<B>>,
    pub pool:       MaxPool2d,
    pub bottleneck: ConvBlock<B>,
    pub upsamplers: Vec<ConvTranspose2d<B>>,
    pub decoders:   Vec<ConvBlock<B>>,
    pub head:       Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    /// x: [slices, in_channels, H, W] → per-pixel probabilities
    /// [slices, out_channels, H, W]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut x = x;
        for encoder in &self.encoders {
            let features = encoder.forward(x);
            skips.push(features.clone());
            x = self.pool.forward(features);
        }

        x = self.bottleneck.forward(x);

        for ((up, decoder), skip) in self
            .upsamplers
            .iter()
            .zip(&self.decoders)
            .zip(skips.into_iter().rev())
        {
            let upsampled = up.forward(x);
            x = decoder.forward(Tensor::cat(vec![skip, upsampled], 1));
        }

        sigmoid(self.head.forward(x))
    }
}
